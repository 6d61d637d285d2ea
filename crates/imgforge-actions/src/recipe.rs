//! Recipe loading
//!
//! A recipe is a YAML document naming the target architecture and the
//! ordered list of actions to run:
//!
//! ```yaml
//! architecture: arm64
//! actions:
//!   - action: image-partition
//!     imagename: debian.img
//!     imagesize: 1GB
//!     partitiontype: gpt
//!     partitions:
//!       - { name: root, fs: ext4, start: 0%, end: 100% }
//!     mountpoints:
//!       - { mountpoint: /, partition: root }
//!   - action: apt
//!     packages: [systemd]
//! ```

use crate::actions::{AptAction, ImagePartitionAction};
use crate::command::CommandRunner;
use crate::traits::Action;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while loading a recipe
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read recipe {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse recipe: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required field: {0}")]
    MissingField(String),
}

/// A parsed recipe
#[derive(Debug, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub architecture: String,

    #[serde(default)]
    pub actions: Vec<RecipeAction>,
}

/// One entry of the recipe's action list, selected by its `action` key
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RecipeAction {
    ImagePartition(ImagePartitionAction),
    Apt(AptAction),
}

impl RecipeAction {
    fn into_action(self, runner: Option<Arc<dyn CommandRunner>>) -> Box<dyn Action> {
        match (self, runner) {
            (RecipeAction::ImagePartition(a), Some(r)) => Box::new(a.with_runner(r)),
            (RecipeAction::ImagePartition(a), None) => Box::new(a),
            (RecipeAction::Apt(a), Some(r)) => Box::new(a.with_runner(r)),
            (RecipeAction::Apt(a), None) => Box::new(a),
        }
    }
}

impl Recipe {
    /// Parse a recipe from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self, RecipeError> {
        let recipe: Recipe = serde_yaml::from_str(yaml)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Read and parse a recipe file
    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        if self.architecture.is_empty() {
            return Err(RecipeError::MissingField("architecture".to_string()));
        }
        if self.actions.is_empty() {
            return Err(RecipeError::MissingField("actions".to_string()));
        }
        Ok(())
    }

    /// Turn the recipe into the pipeline's action list
    pub fn into_actions(self) -> Vec<Box<dyn Action>> {
        self.actions.into_iter().map(|a| a.into_action(None)).collect()
    }

    /// Like [`Recipe::into_actions`], with every action using `runner`
    pub fn into_actions_with_runner(self, runner: Arc<dyn CommandRunner>) -> Vec<Box<dyn Action>> {
        self.actions
            .into_iter()
            .map(|a| a.into_action(Some(runner.clone())))
            .collect()
    }
}
