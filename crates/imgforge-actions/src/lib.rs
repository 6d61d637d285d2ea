//! imgforge action engine
//!
//! Builds bootable disk images from a declarative recipe. A recipe is an
//! ordered list of actions; the [`Pipeline`] drives every action through
//! the same phases and threads one [`BuildContext`] through all of them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  Pipeline                    │
//! │  Verify ─► PreMachine | PreNoMachine         │
//! │        ─► Run ─► Cleanup ─► PostMachine      │
//! │                  │                           │
//! │                  ▼                           │
//! │  ┌──────────────────────────────────────┐    │
//! │  │  Actions: image-partition | apt      │    │
//! │  └──────────────────────────────────────┘    │
//! │                  │                           │
//! │                  ▼                           │
//! │  BlockTargetProvider      CommandRunner      │
//! │  (machine disk | loop)    (parted, mkfs, …)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use imgforge_actions::{BuildContext, Pipeline, Recipe};
//!
//! let recipe = Recipe::load(&path)?;
//! let mut ctx = BuildContext::new(scratch, artifacts, recipe_dir, &recipe.architecture);
//! let mut pipeline = Pipeline::new(recipe.into_actions(), &path);
//! pipeline.run(&mut ctx).await?;
//! ```

pub mod actions;
pub mod command;
pub mod context;
pub mod engine;
pub mod error;
pub mod machine;
pub mod recipe;
pub mod size;
pub mod traits;

pub use command::*;
pub use context::*;
pub use engine::*;
pub use error::*;
pub use machine::*;
pub use recipe::*;
pub use traits::*;
