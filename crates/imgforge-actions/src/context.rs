//! Build context shared by every phase of every action
//!
//! One `BuildContext` exists per build. It is created before the first
//! phase runs and handed to each phase call by reference. Fields written
//! by one action (block target, mount root, boot metadata) are read by
//! actions ordered after it in the recipe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Origin key for the artifact output directory
pub const ORIGIN_ARTIFACTS: &str = "artifacts";
/// Origin key for the target root filesystem
pub const ORIGIN_FILESYSTEM: &str = "filesystem";
/// Origin key for the directory holding the recipe
pub const ORIGIN_RECIPE: &str = "recipe";

/// State threaded through the whole build
pub struct BuildContext {
    /// Scratch directory for intermediate files
    scratchdir: PathBuf,

    /// Target root filesystem (`<scratch>/root`)
    rootdir: PathBuf,

    /// Where finished artifacts are written
    artifactdir: PathBuf,

    /// Directory containing the recipe
    recipe_dir: PathBuf,

    /// Target architecture from the recipe
    architecture: String,

    /// Block target (loop device or sandbox disk)
    image: Option<PathBuf>,

    /// Directory the image partitions are mounted under
    image_mnt_dir: Option<PathBuf>,

    /// Generated fstab
    image_fstab: String,

    /// Generated `root=` kernel parameter
    image_kernel_root: Option<String>,

    /// Well-known locations by name
    origins: HashMap<String, PathBuf>,

    /// Shell to start when the build fails
    debug_shell: Option<String>,
}

impl BuildContext {
    /// Create a new build context
    pub fn new(
        scratchdir: impl Into<PathBuf>,
        artifactdir: impl Into<PathBuf>,
        recipe_dir: impl Into<PathBuf>,
        architecture: impl Into<String>,
    ) -> Self {
        let scratchdir = scratchdir.into();
        let rootdir = scratchdir.join("root");
        let artifactdir = artifactdir.into();
        let recipe_dir = recipe_dir.into();

        let mut origins = HashMap::new();
        origins.insert(ORIGIN_ARTIFACTS.to_string(), artifactdir.clone());
        origins.insert(ORIGIN_FILESYSTEM.to_string(), rootdir.clone());
        origins.insert(ORIGIN_RECIPE.to_string(), recipe_dir.clone());

        Self {
            scratchdir,
            rootdir,
            artifactdir,
            recipe_dir,
            architecture: architecture.into(),
            image: None,
            image_mnt_dir: None,
            image_fstab: String::new(),
            image_kernel_root: None,
            origins,
            debug_shell: None,
        }
    }

    /// Preset the block target (used by the sandboxed instance)
    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Enable the interactive shell on failure
    pub fn with_debug_shell(mut self, shell: impl Into<String>) -> Self {
        self.debug_shell = Some(shell.into());
        self
    }

    pub fn scratchdir(&self) -> &Path {
        &self.scratchdir
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    pub fn artifactdir(&self) -> &Path {
        &self.artifactdir
    }

    pub fn recipe_dir(&self) -> &Path {
        &self.recipe_dir
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Get the block target, if one was provisioned
    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    pub fn set_image(&mut self, image: impl Into<PathBuf>) {
        self.image = Some(image.into());
    }

    /// Get the mount root of the image partitions
    pub fn image_mnt_dir(&self) -> Option<&Path> {
        self.image_mnt_dir.as_deref()
    }

    pub fn set_image_mnt_dir(&mut self, dir: impl Into<PathBuf>) {
        self.image_mnt_dir = Some(dir.into());
    }

    /// Get the generated fstab
    pub fn image_fstab(&self) -> &str {
        &self.image_fstab
    }

    /// Mutable access to the fstab buffer
    pub fn image_fstab_mut(&mut self) -> &mut String {
        &mut self.image_fstab
    }

    /// Get the generated `root=` kernel parameter
    pub fn image_kernel_root(&self) -> Option<&str> {
        self.image_kernel_root.as_deref()
    }

    pub fn set_image_kernel_root(&mut self, param: impl Into<String>) {
        self.image_kernel_root = Some(param.into());
    }

    /// Look up a well-known location by name
    pub fn origin(&self, name: &str) -> Option<&Path> {
        self.origins.get(name).map(|p| p.as_path())
    }

    pub fn origins(&self) -> &HashMap<String, PathBuf> {
        &self.origins
    }

    pub fn debug_shell(&self) -> Option<&str> {
        self.debug_shell.as_deref()
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("scratchdir", &self.scratchdir)
            .field("rootdir", &self.rootdir)
            .field("architecture", &self.architecture)
            .field("image", &self.image)
            .field("image_mnt_dir", &self.image_mnt_dir)
            .field("image_kernel_root", &self.image_kernel_root)
            .finish_non_exhaustive()
    }
}
