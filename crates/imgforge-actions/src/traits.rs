//! Action trait definition
//!
//! Every build step implements [`Action`]. The pipeline drives all actions
//! through the same sequence of phases, finishing one phase for the whole
//! action list before starting the next:
//!
//! ```text
//! Verify ─┬─ PreMachine ──── (sandbox runs Run + Cleanup) ──┬─ PostMachine
//!         └─ PreNoMachine ── Run ── Cleanup ────────────────┘
//! ```

use crate::context::BuildContext;
use crate::error::{ActionError, Result};
use crate::machine::Machine;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lifecycle phase of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Validate configuration; runs on the host before anything else
    Verify,
    /// Request sandbox resources and extend the sandbox arguments
    PreMachine,
    /// Host-side equivalent of `PreMachine` when no sandbox is used
    PreNoMachine,
    /// Perform the action's effect
    Run,
    /// Release what the action acquired
    Cleanup,
    /// Finalize once the privileged part of the build is over
    PostMachine,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Verify => write!(f, "Verify"),
            Phase::PreMachine => write!(f, "PreMachine"),
            Phase::PreNoMachine => write!(f, "PreNoMachine"),
            Phase::Run => write!(f, "Run"),
            Phase::Cleanup => write!(f, "Cleanup"),
            Phase::PostMachine => write!(f, "PostMachine"),
        }
    }
}

/// Core trait for build actions
///
/// Only [`Action::run`] is mandatory; every other phase defaults to doing
/// nothing.
///
/// # Example
///
/// ```ignore
/// use imgforge_actions::{Action, BuildContext, Result};
/// use async_trait::async_trait;
///
/// struct HostnameAction;
///
/// #[async_trait]
/// impl Action for HostnameAction {
///     fn name(&self) -> &str {
///         "hostname"
///     }
///
///     async fn run(&mut self, ctx: &mut BuildContext) -> Result<()> {
///         tokio::fs::write(ctx.rootdir().join("etc/hostname"), "debian\n").await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Action: Send + Sync {
    /// Action name as written in the recipe
    fn name(&self) -> &str;

    /// Human-readable description used in logs
    fn description(&self) -> &str {
        self.name()
    }

    /// Validate configuration and compute derived values
    ///
    /// Must not touch any external resource.
    fn verify(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Prepare sandbox resources before the build machine starts
    async fn pre_machine(
        &mut self,
        ctx: &mut BuildContext,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let _ = (ctx, machine, args);
        Ok(())
    }

    /// Prepare host resources when no build machine is used
    async fn pre_no_machine(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Perform the action
    async fn run(&mut self, ctx: &mut BuildContext) -> Result<()>;

    /// Release resources acquired by earlier phases
    async fn cleanup(&mut self, ctx: &BuildContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Finalize after the privileged part of the build
    async fn post_machine(&mut self, ctx: &BuildContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// A no-op action for testing
pub struct NoopAction {
    name: String,
}

impl NoopAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Action for NoopAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "A no-op action for testing"
    }

    async fn run(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        Ok(())
    }
}

/// Shared log of `(action, phase)` calls, in call order
pub type PhaseLog = Arc<Mutex<Vec<(String, Phase)>>>;

/// An action that records every phase call (for testing the pipeline)
///
/// It can be told to fail at one phase; the failing call is still logged.
pub struct RecordingAction {
    name: String,
    log: PhaseLog,
    fail_at: Option<Phase>,
}

impl RecordingAction {
    pub fn new(name: impl Into<String>, log: PhaseLog) -> Self {
        Self {
            name: name.into(),
            log,
            fail_at: None,
        }
    }

    /// Fail when the given phase is reached
    pub fn failing_at(mut self, phase: Phase) -> Self {
        self.fail_at = Some(phase);
        self
    }

    fn record(&self, phase: Phase) -> Result<()> {
        self.log.lock().unwrap().push((self.name.clone(), phase));
        if self.fail_at == Some(phase) {
            return Err(ActionError::ExecutionFailed(format!(
                "{} failed at {}",
                self.name, phase
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn verify(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        self.record(Phase::Verify)
    }

    async fn pre_machine(
        &mut self,
        _ctx: &mut BuildContext,
        _machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        self.record(Phase::PreMachine)?;
        args.push(format!("--{}", self.name));
        Ok(())
    }

    async fn pre_no_machine(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        self.record(Phase::PreNoMachine)
    }

    async fn run(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        self.record(Phase::Run)
    }

    async fn cleanup(&mut self, _ctx: &BuildContext) -> Result<()> {
        self.record(Phase::Cleanup)
    }

    async fn post_machine(&mut self, _ctx: &BuildContext) -> Result<()> {
        self.record(Phase::PostMachine)
    }
}

/// An action whose Run always fails (for testing error handling)
pub struct FailingAction {
    name: String,
    error_message: String,
}

impl FailingAction {
    pub fn new(name: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error_message: error_message.into(),
        }
    }
}

#[async_trait]
impl Action for FailingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "An action that always fails (for testing)"
    }

    async fn run(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        Err(ActionError::ExecutionFailed(self.error_message.clone()))
    }
}
