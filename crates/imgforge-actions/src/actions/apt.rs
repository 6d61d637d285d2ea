//! Package installation action
//!
//! Installs packages into the target root filesystem with apt-get, run
//! through chroot. Unless the recipe allows it, package maintainer scripts
//! are kept from starting or stopping services by a temporary
//! `policy-rc.d` helper.

use crate::command::{CommandRunner, Invocation, SystemRunner};
use crate::context::BuildContext;
use crate::error::{ActionError, Result};
use crate::traits::Action;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Location of the service policy helper inside the target root
pub const POLICY_HELPER: &str = "usr/sbin/policy-rc.d";

const DENY_SERVICES: &str = "#!/bin/sh\nexit 101\n";

/// Install packages into the target root
///
/// Recipe fields:
/// - `packages` (required): packages to install
/// - `recommends`: also install recommended packages (default false)
/// - `allow-services`: let maintainer scripts manage services (default false)
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AptAction {
    #[serde(default)]
    description: Option<String>,

    #[serde(default)]
    packages: Vec<String>,

    #[serde(default)]
    recommends: bool,

    #[serde(default)]
    allow_services: bool,

    #[serde(skip, default = "default_runner")]
    runner: Arc<dyn CommandRunner>,
}

fn default_runner() -> Arc<dyn CommandRunner> {
    Arc::new(SystemRunner)
}

impl AptAction {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            description: None,
            packages: packages.into_iter().map(Into::into).collect(),
            recommends: false,
            allow_services: false,
            runner: default_runner(),
        }
    }

    pub fn with_recommends(mut self, recommends: bool) -> Self {
        self.recommends = recommends;
        self
    }

    pub fn with_allow_services(mut self, allow: bool) -> Self {
        self.allow_services = allow;
        self
    }

    /// Use a different command runner
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    fn apt_get(&self, root: &Path) -> Invocation {
        Invocation::new("chroot")
            .arg_path(root)
            .arg("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    async fn install(&self, root: &Path) -> Result<()> {
        self.runner.run("apt", &self.apt_get(root).arg("update")).await?;

        let mut install = self.apt_get(root).arg("-y");
        if !self.recommends {
            install = install.arg("--no-install-recommends");
        }
        install = install.arg("install").args(self.packages.iter().map(String::as_str));
        self.runner.run("apt", &install).await?;

        self.runner.run("apt", &self.apt_get(root).arg("clean")).await?;
        Ok(())
    }
}

impl std::fmt::Debug for AptAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AptAction")
            .field("packages", &self.packages)
            .field("recommends", &self.recommends)
            .field("allow_services", &self.allow_services)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for AptAction {
    fn name(&self) -> &str {
        "apt"
    }

    fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("Install packages with apt")
    }

    fn verify(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        if self.packages.is_empty() {
            return Err(ActionError::MissingField("packages".to_string()));
        }
        if let Some(bad) = self.packages.iter().find(|p| p.trim().is_empty()) {
            return Err(ActionError::ValidationFailed(format!(
                "invalid package name: {:?}",
                bad
            )));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let root = ctx.rootdir();
        info!(root = %root.display(), packages = ?self.packages, "Installing packages");

        let helper = if self.allow_services {
            None
        } else {
            deny_services(root).await?
        };

        let result = self.install(root).await;

        if let Some(helper) = helper {
            if let Err(e) = allow_services(&helper).await {
                warn!(helper = %helper.display(), error = %e, "Failed to remove service policy helper");
                return result.and(Err(e));
            }
        }

        result
    }
}

/// Keep maintainer scripts from managing services inside `root`
///
/// Returns the helper path when it was installed by this call, `None` when
/// a helper already exists and is left alone.
pub async fn deny_services(root: &Path) -> Result<Option<PathBuf>> {
    let helper = root.join(POLICY_HELPER);
    if tokio::fs::try_exists(&helper)
        .await
        .map_err(|e| ActionError::path("check", &helper, e))?
    {
        debug!(helper = %helper.display(), "Service policy helper already present");
        return Ok(None);
    }

    if let Some(parent) = helper.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ActionError::path("create directory", parent, e))?;
    }
    tokio::fs::write(&helper, DENY_SERVICES)
        .await
        .map_err(|e| ActionError::path("write", &helper, e))?;
    set_executable(&helper).await?;

    debug!(helper = %helper.display(), "Service start/stop denied");
    Ok(Some(helper))
}

/// Remove a helper installed by [`deny_services`]
pub async fn allow_services(helper: &Path) -> Result<()> {
    tokio::fs::remove_file(helper)
        .await
        .map_err(|e| ActionError::path("remove", helper, e))?;
    debug!(helper = %helper.display(), "Service start/stop allowed");
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| ActionError::path("chmod", path, e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
