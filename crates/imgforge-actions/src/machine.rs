//! Sandbox capability and block-target provisioning
//!
//! A build either runs inside a sandboxed build machine or directly on the
//! host. Actions that need a block device ask a [`BlockTargetProvider`] for
//! one; which provider is used depends on that choice:
//!
//! - [`MachineTargetProvider`] asks the build machine for a virtual disk.
//!   The machine owns it and tears it down when it exits.
//! - [`LoopDeviceProvider`] creates a sized image file and attaches it to a
//!   loop device. The caller owns detaching it.
//!
//! The returned [`BlockTarget`] records its [`TargetOwner`] so release is
//! decided once, at acquisition time.
//!
//! Whether a machine is available at all is asked of a [`MachineBackend`].
//! A machine can also be given [`BuildStorage`], an ext4 scratch disk on the
//! host that the inner build mounts at `/scratch`.

use crate::command::{CommandRunner, Invocation};
use crate::error::{ActionError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempPath;
use tracing::{debug, info};

/// An isolated build machine the pipeline can relaunch itself in
#[async_trait]
pub trait Machine: Send {
    /// Attach a virtual disk backed by `image` with the given size in bytes
    ///
    /// Returns the device path the disk will have inside the machine.
    async fn create_image(&mut self, image: &Path, size: u64) -> Result<PathBuf>;

    /// Share a host directory with the machine
    fn add_volume(&mut self, path: &Path);

    /// Add a line to the machine's `/etc/fstab`, mounted before the inner
    /// build starts
    fn add_fstab_entry(&mut self, device: &str, mountpoint: &str, fstype: &str, options: &str);

    /// Boot the machine, run the build with `args` inside it and return the
    /// exit code of that inner build
    async fn run_with_args(&mut self, args: &[String]) -> Result<i32>;
}

/// Source of build machines
pub trait MachineBackend {
    /// A fresh machine, or `None` when this host cannot run one
    fn machine(&self) -> Option<Box<dyn Machine>>;
}

/// Backend for hosts without sandbox support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMachine;

impl MachineBackend for NoMachine {
    fn machine(&self) -> Option<Box<dyn Machine>> {
        None
    }
}

/// Scratch disk for the build machine
///
/// A sized image file is created in `dir`, formatted ext4 with the label
/// `/scratch`, attached to the machine and mounted at `/scratch` inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStorage {
    dir: PathBuf,
    size: u64,
}

impl BuildStorage {
    /// Filesystem label and mountpoint inside the machine
    pub const MOUNTPOINT: &'static str = "/scratch";

    pub fn new(dir: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            dir: dir.into(),
            size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Create and format the scratch image, then attach it to `machine`
    ///
    /// The image file is deleted when the returned path is dropped, so the
    /// caller keeps it until the machine has exited.
    pub async fn prepare(&self, machine: &mut dyn Machine, runner: &dyn CommandRunner) -> Result<TempPath> {
        let meta = tokio::fs::metadata(&self.dir)
            .await
            .map_err(|e| ActionError::path("failed to stat build storage", &self.dir, e))?;
        if !meta.is_dir() {
            return Err(ActionError::Machine(format!(
                "build storage location {} is not a directory",
                self.dir.display()
            )));
        }

        let file = tempfile::Builder::new()
            .prefix(".imgforge-build-")
            .tempfile_in(&self.dir)
            .map_err(|e| ActionError::path("failed to create build image in", &self.dir, e))?;
        file.as_file()
            .set_len(self.size)
            .map_err(|e| ActionError::path("failed to resize build image", file.path(), e))?;
        let image = file.into_temp_path();

        runner
            .run(
                "mkfs.ext4",
                &Invocation::new("mkfs.ext4")
                    .args(["-q", "-L", Self::MOUNTPOINT])
                    .arg_path(&image)
                    .args(["-O", "^has_journal"]),
            )
            .await?;

        let device = machine.create_image(&image, self.size).await?;
        let label = format!("LABEL={}", Self::MOUNTPOINT);
        machine.add_fstab_entry(&label, Self::MOUNTPOINT, "ext4", "defaults");

        info!(image = %image.display(), device = %device.display(), size = self.size, "Build storage attached");
        Ok(image)
    }
}

/// Who releases a block target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOwner {
    /// The build machine; nothing to release on our side
    Machine,
    /// A loop device attached by this process
    LoopDevice,
}

/// A block device ready for partitioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTarget {
    path: PathBuf,
    owner: TargetOwner,
}

impl BlockTarget {
    pub fn new(path: impl Into<PathBuf>, owner: TargetOwner) -> Self {
        Self {
            path: path.into(),
            owner,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> TargetOwner {
        self.owner
    }

    /// Release the target if this process owns it
    pub async fn release(&self, runner: &dyn CommandRunner) -> Result<()> {
        match self.owner {
            TargetOwner::Machine => {
                debug!(target = %self.path.display(), "Block target owned by build machine, nothing to release");
                Ok(())
            }
            TargetOwner::LoopDevice => LoopDeviceProvider::detach(runner, &self.path).await,
        }
    }
}

/// Source of block targets
#[async_trait]
pub trait BlockTargetProvider: Send {
    /// Provide a block target of `size` bytes backed by `image`
    async fn acquire(&mut self, image: &Path, size: u64) -> Result<BlockTarget>;
}

/// Block targets handed out by a build machine
pub struct MachineTargetProvider<'a> {
    machine: &'a mut dyn Machine,
}

impl<'a> MachineTargetProvider<'a> {
    pub fn new(machine: &'a mut dyn Machine) -> Self {
        Self { machine }
    }
}

#[async_trait]
impl BlockTargetProvider for MachineTargetProvider<'_> {
    async fn acquire(&mut self, image: &Path, size: u64) -> Result<BlockTarget> {
        let path = self.machine.create_image(image, size).await?;
        info!(image = %image.display(), device = %path.display(), size, "Build machine disk created");
        Ok(BlockTarget::new(path, TargetOwner::Machine))
    }
}

/// Block targets backed by host loop devices
pub struct LoopDeviceProvider {
    runner: Arc<dyn CommandRunner>,
}

impl LoopDeviceProvider {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Detach a loop device
    pub async fn detach(runner: &dyn CommandRunner, device: &Path) -> Result<()> {
        runner
            .run("losetup", &Invocation::new("losetup").arg("-d").arg_path(device))
            .await?;
        info!(device = %device.display(), "Loop device detached");
        Ok(())
    }
}

#[async_trait]
impl BlockTargetProvider for LoopDeviceProvider {
    async fn acquire(&mut self, image: &Path, size: u64) -> Result<BlockTarget> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(image)
            .await
            .map_err(|e| ActionError::path("open image file", image, e))?;
        file.set_len(size)
            .await
            .map_err(|e| ActionError::path("resize image file", image, e))?;
        drop(file);

        let output = self
            .runner
            .run(
                "losetup",
                &Invocation::new("losetup").args(["-f", "--show"]).arg_path(image),
            )
            .await?;

        let device = output.stdout.trim();
        if device.is_empty() {
            return Err(ActionError::ExecutionFailed(format!(
                "losetup did not report a loop device for {}",
                image.display()
            )));
        }

        info!(image = %image.display(), device = %device, size, "Image attached to loop device");
        Ok(BlockTarget::new(device, TargetOwner::LoopDevice))
    }
}

/// Everything a [`RecordingMachine`] was asked to do
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    /// `(image, size)` for every disk requested
    pub images: Vec<(PathBuf, u64)>,
    /// Shared host directories
    pub volumes: Vec<PathBuf>,
    /// Arguments of every launch
    pub launches: Vec<Vec<String>>,
    /// fstab lines added to the machine
    pub fstab: Vec<String>,
}

/// A build machine that records requests instead of booting (for testing)
///
/// Clones share the same record, so a test can keep one handle while the
/// pipeline owns another.
#[derive(Debug, Default, Clone)]
pub struct RecordingMachine {
    record: Arc<Mutex<MachineRecord>>,
    exit_code: i32,
}

impl RecordingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit code reported for the inner build
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn record(&self) -> MachineRecord {
        self.record.lock().unwrap().clone()
    }
}

#[async_trait]
impl Machine for RecordingMachine {
    async fn create_image(&mut self, image: &Path, size: u64) -> Result<PathBuf> {
        let mut record = self.record.lock().unwrap();
        record.images.push((image.to_path_buf(), size));
        // Extra disks follow the root disk: /dev/vdb, /dev/vdc, ...
        let letter = (b'a' + record.images.len() as u8) as char;
        Ok(PathBuf::from(format!("/dev/vd{}", letter)))
    }

    fn add_volume(&mut self, path: &Path) {
        self.record.lock().unwrap().volumes.push(path.to_path_buf());
    }

    fn add_fstab_entry(&mut self, device: &str, mountpoint: &str, fstype: &str, options: &str) {
        self.record
            .lock()
            .unwrap()
            .fstab
            .push(format!("{device}\t{mountpoint}\t{fstype}\t{options}\t0\t0"));
    }

    async fn run_with_args(&mut self, args: &[String]) -> Result<i32> {
        self.record.lock().unwrap().launches.push(args.to_vec());
        Ok(self.exit_code)
    }
}

/// Hands out clones sharing one record
impl MachineBackend for RecordingMachine {
    fn machine(&self) -> Option<Box<dyn Machine>> {
        Some(Box::new(self.clone()))
    }
}
