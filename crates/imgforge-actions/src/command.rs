//! External command execution
//!
//! Every host tool an action drives (parted, mkfs, blkid, losetup, mount,
//! apt-get) goes through a [`CommandRunner`]. Production code uses
//! [`SystemRunner`]; tests swap in [`RecordingRunner`] to capture the exact
//! command lines without touching the host.

use crate::error::{ActionError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// A fully specified external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a path argument
    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful exit with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// An unsuccessful exit with the given stderr
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit status: {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Executes external commands on behalf of actions
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion and capture its output
    ///
    /// Only failure to start the process is an error here; a non-zero exit
    /// is reported through [`CommandOutput::code`].
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run the command and require a successful exit
    async fn run(&self, label: &str, invocation: &Invocation) -> Result<CommandOutput> {
        let output = self.output(invocation).await?;
        if !output.is_success() {
            return Err(ActionError::CommandFailed {
                label: label.to_string(),
                status: output.status(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation, "Running command");

        let output = tokio::process::Command::new(invocation.program())
            .args(invocation.arguments())
            .envs(invocation.envs().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|source| ActionError::CommandSpawn {
                program: invocation.program().to_string(),
                source,
            })?;

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %invocation, code = ?output.code, "Command finished");
        Ok(output)
    }
}

type Responder = Box<dyn Fn(&Invocation) -> CommandOutput + Send + Sync>;

/// A runner that records every invocation instead of executing it
///
/// By default every command succeeds with empty output. A responder can
/// script per-command results (loop device names, blkid UUIDs, failures).
pub struct RecordingRunner {
    invocations: Mutex<Vec<Invocation>>,
    responder: Responder,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::with_responder(|_| CommandOutput::success(""))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Invocation) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            invocations: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Recorded command lines, rendered with `Display`
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations().iter().map(|i| i.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.lock().unwrap().is_empty()
    }
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordingRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingRunner")
            .field("invocations", &self.invocations.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());
        Ok((self.responder)(invocation))
    }
}
