//! Pipeline driver
//!
//! The [`Pipeline`] owns the ordered action list of a recipe and drives it
//! through the action phases, one phase at a time across every action.
//! It decides once per build whether a sandboxed build machine is used.

use crate::command::{CommandRunner, SystemRunner};
use crate::context::BuildContext;
use crate::error::{ActionError, BuildError};
use crate::machine::{BuildStorage, Machine, MachineBackend};
use crate::traits::{Action, Phase};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where this process sits relative to the build machine
enum Placement {
    /// On the host with no sandbox available
    Host,
    /// On the host, relaunching the build inside a machine
    Outside(Box<dyn Machine>),
    /// Already inside the build machine
    Inside,
}

/// Executes a recipe's actions phase by phase
///
/// # Example
///
/// ```ignore
/// use imgforge_actions::{BuildContext, Pipeline};
///
/// let mut ctx = BuildContext::new(scratch, artifacts, recipe_dir, "arm64");
/// let mut pipeline = Pipeline::new(recipe.into_actions(), recipe_path);
/// pipeline.run(&mut ctx).await?;
/// ```
pub struct Pipeline {
    /// Actions in recipe order
    actions: Vec<Box<dyn Action>>,

    /// Recipe file, passed on to the build machine
    recipe: PathBuf,

    placement: Placement,

    /// Scratch disk handed to the build machine
    build_storage: Option<BuildStorage>,

    /// Runs host tools the pipeline needs itself
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    /// Create a pipeline that runs directly on the host
    pub fn new(actions: Vec<Box<dyn Action>>, recipe: impl Into<PathBuf>) -> Self {
        Self {
            actions,
            recipe: recipe.into(),
            placement: Placement::Host,
            build_storage: None,
            runner: Arc::new(SystemRunner),
        }
    }

    /// Use a different command runner
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Relaunch the privileged phases inside a build machine
    pub fn with_machine(mut self, machine: Box<dyn Machine>) -> Self {
        self.placement = Placement::Outside(machine);
        self
    }

    /// Ask `backend` for a build machine, staying on the host without one
    pub fn select_machine(self, backend: &dyn MachineBackend) -> Self {
        match backend.machine() {
            Some(machine) => {
                debug!("Build machine available");
                self.with_machine(machine)
            }
            None => {
                info!("build machine not supported, running on the host");
                self
            }
        }
    }

    /// Give the build machine a scratch disk mounted at `/scratch`
    pub fn with_build_storage(mut self, storage: BuildStorage) -> Self {
        self.build_storage = Some(storage);
        self
    }

    /// Mark this process as the instance running inside the build machine
    pub fn inside_machine(mut self) -> Self {
        self.placement = Placement::Inside;
        self
    }

    /// Get all action names in order
    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    /// Run the whole build
    ///
    /// The first failing phase aborts the build. Actions after the failing
    /// one get no further calls.
    pub async fn run(&mut self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        info!(actions = ?self.action_names(), "Starting build");

        for action in self.actions.iter_mut() {
            debug!(action = %action.name(), "Verifying");
            action
                .verify(ctx)
                .map_err(|e| action_failed(&**action, Phase::Verify, e))?;
        }

        match std::mem::replace(&mut self.placement, Placement::Inside) {
            Placement::Inside => {
                self.run_and_cleanup(ctx).await?;
                info!("==== Build machine stage done ====");
                return Ok(());
            }
            Placement::Outside(mut machine) => {
                let result = self.run_in_machine(ctx, machine.as_mut()).await;
                self.placement = Placement::Outside(machine);
                result?;
            }
            Placement::Host => {
                self.placement = Placement::Host;
                if let Some(storage) = &self.build_storage {
                    warn!(dir = %storage.dir().display(), "Build storage needs a build machine, ignoring");
                }
                debug!("Running on the host");
                self.run_on_host(ctx).await?;
            }
        }

        for action in self.actions.iter_mut() {
            action
                .post_machine(ctx)
                .await
                .map_err(|e| action_failed(&**action, Phase::PostMachine, e))?;
        }

        info!("==== Recipe done ====");
        Ok(())
    }

    async fn run_in_machine(
        &mut self,
        ctx: &mut BuildContext,
        machine: &mut dyn Machine,
    ) -> Result<(), BuildError> {
        let mut args = Vec::new();

        machine.add_volume(ctx.artifactdir());
        args.push("--artifactdir".to_string());
        args.push(ctx.artifactdir().display().to_string());

        // Removed from the host once the machine is gone
        let _build_image = match &self.build_storage {
            Some(storage) => {
                let image = storage
                    .prepare(machine, self.runner.as_ref())
                    .await
                    .map_err(BuildError::BuildStorage)?;
                args.push("--scratchdir".to_string());
                args.push(BuildStorage::MOUNTPOINT.to_string());
                Some(image)
            }
            None => None,
        };

        machine.add_volume(ctx.recipe_dir());
        args.push(self.recipe.display().to_string());

        if let Some(shell) = ctx.debug_shell() {
            args.push("--debug-shell".to_string());
            args.push("--shell".to_string());
            args.push(shell.to_string());
        }

        for action in self.actions.iter_mut() {
            action
                .pre_machine(ctx, machine, &mut args)
                .await
                .map_err(|e| action_failed(&**action, Phase::PreMachine, e))?;
        }

        info!(args = ?args, "Launching build machine");
        let code = machine
            .run_with_args(&args)
            .await
            .map_err(BuildError::MachineLaunch)?;
        if code != 0 {
            error!(code, "Build machine failed");
            return Err(BuildError::MachineExit(code));
        }

        Ok(())
    }

    async fn run_on_host(&mut self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        for idx in 0..self.actions.len() {
            let result = self.actions[idx].pre_no_machine(ctx).await;
            if let Err(e) = result {
                return Err(self.abort(ctx, idx, Phase::PreNoMachine, e).await);
            }
        }

        self.run_and_cleanup(ctx).await
    }

    async fn run_and_cleanup(&mut self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        for idx in 0..self.actions.len() {
            let action = &mut self.actions[idx];
            info!(action = %action.name(), description = %action.description(), "Running");
            let result = action.run(ctx).await;
            if let Err(e) = result {
                return Err(self.abort(ctx, idx, Phase::Run, e).await);
            }
        }

        for action in self.actions.iter_mut() {
            action
                .cleanup(ctx)
                .await
                .map_err(|e| action_failed(&**action, Phase::Cleanup, e))?;
        }

        Ok(())
    }

    /// Clean up the actions before `failed` and build the error for it
    ///
    /// The failing action itself is not cleaned up.
    async fn abort(
        &mut self,
        ctx: &BuildContext,
        failed: usize,
        phase: Phase,
        source: ActionError,
    ) -> BuildError {
        let err = action_failed(&*self.actions[failed], phase, source);
        error!(error = %err, "Aborting build");

        for action in self.actions[..failed].iter_mut() {
            if let Err(e) = action.cleanup(ctx).await {
                warn!(action = %action.name(), error = %e, "Cleanup after failure also failed");
            }
        }

        err
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let placement = match self.placement {
            Placement::Host => "host",
            Placement::Outside(_) => "outside-machine",
            Placement::Inside => "inside-machine",
        };
        f.debug_struct("Pipeline")
            .field("actions", &self.action_names())
            .field("recipe", &self.recipe)
            .field("placement", &placement)
            .field("build_storage", &self.build_storage)
            .finish()
    }
}

fn action_failed(action: &dyn Action, phase: Phase, source: ActionError) -> BuildError {
    BuildError::Action {
        action: action.name().to_string(),
        phase,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingRunner};
    use crate::machine::{NoMachine, RecordingMachine};
    use crate::traits::{FailingAction, NoopAction, PhaseLog, RecordingAction};

    fn test_context() -> BuildContext {
        BuildContext::new("/scratch", "/out", "/recipes", "amd64")
    }

    fn recorded(log: &PhaseLog) -> Vec<(String, Phase)> {
        log.lock().unwrap().clone()
    }

    fn calls(names: &[&str], phases: &[Phase]) -> Vec<(String, Phase)> {
        phases
            .iter()
            .flat_map(|phase| names.iter().map(move |n| (n.to_string(), *phase)))
            .collect()
    }

    fn recording_pipeline(log: &PhaseLog, names: &[&str]) -> Pipeline {
        let actions = names
            .iter()
            .map(|n| Box::new(RecordingAction::new(*n, log.clone())) as Box<dyn Action>)
            .collect();
        Pipeline::new(actions, "/recipes/image.yaml")
    }

    #[tokio::test]
    async fn test_host_build_is_phase_major() {
        let log = PhaseLog::default();
        let mut pipeline = recording_pipeline(&log, &["a", "b", "c"]);

        pipeline.run(&mut test_context()).await.unwrap();

        assert_eq!(
            recorded(&log),
            calls(
                &["a", "b", "c"],
                &[
                    Phase::Verify,
                    Phase::PreNoMachine,
                    Phase::Run,
                    Phase::Cleanup,
                    Phase::PostMachine
                ]
            )
        );
    }

    #[tokio::test]
    async fn test_inside_machine_skips_pre_and_post() {
        let log = PhaseLog::default();
        let mut pipeline = recording_pipeline(&log, &["a", "b"]).inside_machine();

        pipeline.run(&mut test_context()).await.unwrap();

        assert_eq!(
            recorded(&log),
            calls(&["a", "b"], &[Phase::Verify, Phase::Run, Phase::Cleanup])
        );
    }

    #[tokio::test]
    async fn test_machine_build_relaunches_with_args() {
        let log = PhaseLog::default();
        let machine = RecordingMachine::new();
        let mut pipeline =
            recording_pipeline(&log, &["a", "b"]).with_machine(Box::new(machine.clone()));
        let mut ctx = test_context().with_debug_shell("/bin/sh");

        pipeline.run(&mut ctx).await.unwrap();

        assert_eq!(
            recorded(&log),
            calls(&["a", "b"], &[Phase::Verify, Phase::PreMachine, Phase::PostMachine])
        );

        let record = machine.record();
        assert_eq!(
            record.volumes,
            vec![PathBuf::from("/out"), PathBuf::from("/recipes")]
        );
        assert_eq!(
            record.launches,
            vec![vec![
                "--artifactdir".to_string(),
                "/out".to_string(),
                "/recipes/image.yaml".to_string(),
                "--debug-shell".to_string(),
                "--shell".to_string(),
                "/bin/sh".to_string(),
                "--a".to_string(),
                "--b".to_string(),
            ]]
        );
    }

    #[tokio::test]
    async fn test_machine_nonzero_exit_fails_build() {
        let log = PhaseLog::default();
        let mut pipeline = recording_pipeline(&log, &["a"])
            .with_machine(Box::new(RecordingMachine::new().with_exit_code(2)));

        let err = pipeline.run(&mut test_context()).await.unwrap_err();

        assert!(matches!(err, BuildError::MachineExit(2)));
        assert_eq!(
            recorded(&log),
            calls(&["a"], &[Phase::Verify, Phase::PreMachine])
        );
    }

    #[tokio::test]
    async fn test_verify_failure_stops_everything() {
        let log = PhaseLog::default();
        let actions: Vec<Box<dyn Action>> = vec![
            Box::new(RecordingAction::new("a", log.clone())),
            Box::new(RecordingAction::new("b", log.clone()).failing_at(Phase::Verify)),
            Box::new(RecordingAction::new("c", log.clone())),
        ];
        let mut pipeline = Pipeline::new(actions, "recipe.yaml");

        let err = pipeline.run(&mut test_context()).await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Verify));
        assert!(err.to_string().contains("action `b` failed at stage Verify"));
        assert_eq!(recorded(&log), calls(&["a", "b"], &[Phase::Verify]));
    }

    #[tokio::test]
    async fn test_run_failure_cleans_up_earlier_actions_only() {
        let log = PhaseLog::default();
        let actions: Vec<Box<dyn Action>> = vec![
            Box::new(RecordingAction::new("a", log.clone())),
            Box::new(RecordingAction::new("b", log.clone()).failing_at(Phase::Run)),
            Box::new(RecordingAction::new("c", log.clone())),
        ];
        let mut pipeline = Pipeline::new(actions, "recipe.yaml");

        let err = pipeline.run(&mut test_context()).await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Run));
        let mut expected = calls(&["a", "b", "c"], &[Phase::Verify, Phase::PreNoMachine]);
        expected.push(("a".to_string(), Phase::Run));
        expected.push(("b".to_string(), Phase::Run));
        expected.push(("a".to_string(), Phase::Cleanup));
        assert_eq!(recorded(&log), expected);
    }

    #[tokio::test]
    async fn test_pre_no_machine_failure_cleans_up_earlier_actions_only() {
        let log = PhaseLog::default();
        let actions: Vec<Box<dyn Action>> = vec![
            Box::new(RecordingAction::new("a", log.clone())),
            Box::new(RecordingAction::new("b", log.clone()).failing_at(Phase::PreNoMachine)),
            Box::new(RecordingAction::new("c", log.clone())),
        ];
        let mut pipeline = Pipeline::new(actions, "recipe.yaml");

        let err = pipeline.run(&mut test_context()).await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::PreNoMachine));
        assert!(err.to_string().contains("action `b` failed at stage PreNoMachine"));
        let mut expected = calls(&["a", "b", "c"], &[Phase::Verify]);
        expected.push(("a".to_string(), Phase::PreNoMachine));
        expected.push(("b".to_string(), Phase::PreNoMachine));
        expected.push(("a".to_string(), Phase::Cleanup));
        assert_eq!(recorded(&log), expected);
        for phase in [Phase::Run, Phase::Cleanup] {
            for name in ["b", "c"] {
                assert!(!recorded(&log).contains(&(name.to_string(), phase)));
            }
        }
    }

    #[tokio::test]
    async fn test_select_machine_uses_available_backend() {
        let log = PhaseLog::default();
        let machine = RecordingMachine::new();
        let mut pipeline = recording_pipeline(&log, &["a"]).select_machine(&machine);

        assert!(format!("{:?}", pipeline).contains("outside-machine"));
        pipeline.run(&mut test_context()).await.unwrap();

        assert_eq!(machine.record().launches.len(), 1);
        assert_eq!(
            recorded(&log),
            calls(&["a"], &[Phase::Verify, Phase::PreMachine, Phase::PostMachine])
        );
    }

    #[tokio::test]
    async fn test_select_machine_without_backend_runs_on_host() {
        let log = PhaseLog::default();
        let mut pipeline = recording_pipeline(&log, &["a"]).select_machine(&NoMachine);

        assert!(format!("{:?}", pipeline).contains("host"));
        pipeline.run(&mut test_context()).await.unwrap();

        assert!(recorded(&log).contains(&("a".to_string(), Phase::PreNoMachine)));
        assert!(recorded(&log).contains(&("a".to_string(), Phase::Run)));
    }

    #[tokio::test]
    async fn test_build_storage_is_attached_before_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let log = PhaseLog::default();
        let runner = Arc::new(RecordingRunner::new());
        let machine = RecordingMachine::new();
        let mut pipeline = recording_pipeline(&log, &["a"])
            .with_machine(Box::new(machine.clone()))
            .with_runner(runner.clone())
            .with_build_storage(BuildStorage::new(tmp.path(), 10_000_000));

        pipeline.run(&mut test_context()).await.unwrap();

        let record = machine.record();
        assert_eq!(record.images.len(), 1);
        let (image, size) = &record.images[0];
        assert_eq!(*size, 10_000_000);
        assert_eq!(image.parent(), Some(tmp.path()));
        assert_eq!(record.fstab, vec!["LABEL=/scratch\t/scratch\text4\tdefaults\t0\t0".to_string()]);
        assert_eq!(
            record.launches[0][..5],
            ["--artifactdir", "/out", "--scratchdir", "/scratch", "/recipes/image.yaml"]
        );
        assert!(runner.command_lines()[0].starts_with("mkfs.ext4 -q -L /scratch "));

        // The scratch image does not outlive the machine
        assert!(!image.exists());
    }

    #[tokio::test]
    async fn test_build_storage_failure_stops_before_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let log = PhaseLog::default();
        let runner = Arc::new(RecordingRunner::with_responder(|_| {
            CommandOutput::failure(1, "mkfs.ext4: Device size reported to be zero")
        }));
        let machine = RecordingMachine::new();
        let mut pipeline = recording_pipeline(&log, &["a"])
            .with_machine(Box::new(machine.clone()))
            .with_runner(runner)
            .with_build_storage(BuildStorage::new(tmp.path(), 0));

        let err = pipeline.run(&mut test_context()).await.unwrap_err();

        assert!(matches!(err, BuildError::BuildStorage(_)));
        assert!(machine.record().launches.is_empty());
        assert_eq!(recorded(&log), calls(&["a"], &[Phase::Verify]));
    }

    #[tokio::test]
    async fn test_build_storage_ignored_on_host() {
        let tmp = tempfile::tempdir().unwrap();
        let log = PhaseLog::default();
        let runner = Arc::new(RecordingRunner::new());
        let mut pipeline = recording_pipeline(&log, &["a"])
            .with_runner(runner.clone())
            .with_build_storage(BuildStorage::new(tmp.path(), 1024));

        pipeline.run(&mut test_context()).await.unwrap();

        assert!(runner.is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_aborts() {
        let log = PhaseLog::default();
        let actions: Vec<Box<dyn Action>> = vec![
            Box::new(RecordingAction::new("a", log.clone()).failing_at(Phase::Cleanup)),
            Box::new(RecordingAction::new("b", log.clone())),
        ];
        let mut pipeline = Pipeline::new(actions, "recipe.yaml");

        let err = pipeline.run(&mut test_context()).await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Cleanup));
        assert_eq!(recorded(&log).last().unwrap(), &("a".to_string(), Phase::Cleanup));
        assert!(!recorded(&log).contains(&("b".to_string(), Phase::Cleanup)));
    }

    #[tokio::test]
    async fn test_failing_run_reports_message() {
        let actions: Vec<Box<dyn Action>> = vec![
            Box::new(NoopAction::new("noop")),
            Box::new(FailingAction::new("fail", "Intentional failure")),
        ];
        let mut pipeline = Pipeline::new(actions, "recipe.yaml");

        let err = pipeline.run(&mut test_context()).await.unwrap_err();
        assert!(err.to_string().contains("Intentional failure"));
    }

    #[test]
    fn test_pipeline_debug() {
        let pipeline = Pipeline::new(vec![Box::new(NoopAction::new("noop"))], "recipe.yaml");

        let debug = format!("{:?}", pipeline);
        assert!(debug.contains("Pipeline"));
        assert!(debug.contains("noop"));
        assert!(debug.contains("host"));
    }
}
