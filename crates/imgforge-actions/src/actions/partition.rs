//! Disk image partitioning action
//!
//! Creates the disk image, partitions it with parted, formats every
//! partition and mounts the result under `<scratch>/mnt`. The generated
//! fstab and `root=` kernel parameter are published through the
//! [`BuildContext`] for actions later in the recipe.
//!
//! The block device comes from the build machine when one is used
//! ([`MachineTargetProvider`]) or from a host loop device otherwise
//! ([`LoopDeviceProvider`]).

use crate::command::{CommandRunner, Invocation, SystemRunner};
use crate::context::BuildContext;
use crate::error::{ActionError, Result};
use crate::machine::{BlockTarget, BlockTargetProvider, LoopDeviceProvider, Machine, MachineTargetProvider};
use crate::size::{parse_human_size, parse_offset};
use crate::traits::Action;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One partition of the image
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Partition {
    /// Partition name, also used as filesystem label
    #[serde(default)]
    pub name: String,

    /// Filesystem type (`fat32` is formatted and mounted as vfat)
    #[serde(default)]
    pub fs: String,

    #[serde(default)]
    pub start: String,

    #[serde(default)]
    pub end: String,

    /// Flags passed to `parted set`
    #[serde(default)]
    pub flags: Vec<String>,

    /// Ordinal in the partition table, assigned at verify
    #[serde(skip)]
    number: usize,

    /// Filesystem UUID, known once the partition is formatted
    #[serde(skip)]
    fs_uuid: String,
}

impl Partition {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn fs_uuid(&self) -> &str {
        &self.fs_uuid
    }

    /// Filesystem type as understood by mount and fstab
    fn mount_fs(&self) -> &str {
        match self.fs.as_str() {
            "fat32" => "vfat",
            fs => fs,
        }
    }
}

/// Where a partition is mounted in the target root
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Mountpoint {
    #[serde(default)]
    pub mountpoint: String,

    /// Name of the partition to mount
    #[serde(default)]
    pub partition: String,

    /// Extra fstab options, appended after `defaults`
    #[serde(default)]
    pub options: Vec<String>,

    /// Index of the resolved partition
    #[serde(skip)]
    part: Option<usize>,
}

/// Create, partition, format and mount a disk image
///
/// Recipe fields:
/// - `imagename` (required): image file, relative to the artifact directory
/// - `imagesize` (required): human-readable size, e.g. `1GB`
/// - `partitiontype` (required): `gpt` or `msdos`
/// - `partitions` (required): at least one [`Partition`]
/// - `mountpoints`: list of [`Mountpoint`]
#[derive(Deserialize)]
pub struct ImagePartitionAction {
    #[serde(default)]
    description: Option<String>,

    #[serde(rename = "imagename", default)]
    image_name: String,

    #[serde(rename = "imagesize", default)]
    image_size: String,

    #[serde(rename = "partitiontype", default)]
    partition_type: String,

    #[serde(default)]
    partitions: Vec<Partition>,

    #[serde(default)]
    mountpoints: Vec<Mountpoint>,

    /// Image size in bytes, parsed at verify
    #[serde(skip)]
    size: u64,

    /// Block target acquired by this process
    #[serde(skip)]
    target: Option<BlockTarget>,

    /// Directories mounted by run, in mount order
    #[serde(skip)]
    mounted: Vec<PathBuf>,

    #[serde(skip, default = "default_runner")]
    runner: Arc<dyn CommandRunner>,
}

fn default_runner() -> Arc<dyn CommandRunner> {
    Arc::new(SystemRunner)
}

impl ImagePartitionAction {
    /// Use a different command runner
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn mountpoints(&self) -> &[Mountpoint] {
        &self.mountpoints
    }

    /// Image size in bytes (zero until verified)
    pub fn size(&self) -> u64 {
        self.size
    }

    fn image_path(&self, ctx: &BuildContext) -> PathBuf {
        ctx.artifactdir().join(&self.image_name)
    }

    fn mounted_partition(&self, mount: &Mountpoint) -> Result<&Partition> {
        mount
            .part
            .and_then(|idx| self.partitions.get(idx))
            .ok_or_else(|| {
                ActionError::ValidationFailed(format!(
                    "mountpoint {} is not resolved to a partition",
                    mount.mountpoint
                ))
            })
    }

    async fn format_partition(&self, partition: &Partition, target: &Path) -> Result<String> {
        let device = partition_device_path(target, partition.number);
        info!(partition = %partition.name, device = %device.display(), fs = %partition.fs, "Formatting partition");

        let mkfs = match partition.fs.as_str() {
            "fat32" => Invocation::new("mkfs.vfat").arg("-n"),
            fs => Invocation::new(format!("mkfs.{}", fs)).arg("-L"),
        };
        self.runner
            .run(
                &format!("Formatting partition {}", partition.number),
                &mkfs.arg(partition.name.as_str()).arg_path(&device),
            )
            .await?;

        let output = self
            .runner
            .run(
                "blkid",
                &Invocation::new("blkid")
                    .args(["-o", "value", "-s", "UUID", "-p", "-c", "none"])
                    .arg_path(&device),
            )
            .await?;

        let uuid = output.stdout.trim();
        if uuid.is_empty() {
            return Err(ActionError::ExecutionFailed(format!(
                "no filesystem UUID reported for {}",
                device.display()
            )));
        }
        debug!(partition = %partition.name, uuid = %uuid, "Partition formatted");
        Ok(uuid.to_string())
    }

    /// Render fstab entries for every mountpoint, in declaration order
    fn generate_fstab(&self) -> Result<String> {
        let mut fstab = String::new();

        for mount in &self.mountpoints {
            let part = self.mounted_partition(mount)?;
            if part.fs_uuid.is_empty() {
                return Err(ActionError::ValidationFailed(format!(
                    "missing filesystem UUID for partition {}",
                    part.name
                )));
            }

            let mut options = vec!["defaults"];
            options.extend(mount.options.iter().map(String::as_str));

            fstab.push_str(&format!(
                "UUID={}\t{}\t{}\t{}\t0\t0\n",
                part.fs_uuid,
                mount.mountpoint,
                part.mount_fs(),
                options.join(",")
            ));
        }

        Ok(fstab)
    }

    /// Kernel `root=` parameter for the partition mounted at `/`, if any
    fn kernel_root(&self) -> Result<Option<String>> {
        let Some(mount) = self.mountpoints.iter().find(|m| m.mountpoint == "/") else {
            return Ok(None);
        };

        let part = self.mounted_partition(mount)?;
        if part.fs_uuid.is_empty() {
            return Err(ActionError::ValidationFailed(format!(
                "missing filesystem UUID for root partition {}",
                part.name
            )));
        }
        Ok(Some(format!("root=UUID={}", part.fs_uuid)))
    }
}

impl std::fmt::Debug for ImagePartitionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePartitionAction")
            .field("image_name", &self.image_name)
            .field("image_size", &self.image_size)
            .field("partition_type", &self.partition_type)
            .field("partitions", &self.partitions)
            .field("mountpoints", &self.mountpoints)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for ImagePartitionAction {
    fn name(&self) -> &str {
        "image-partition"
    }

    fn description(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or("Partition and format a disk image")
    }

    fn verify(&mut self, _ctx: &mut BuildContext) -> Result<()> {
        if self.image_name.is_empty() {
            return Err(ActionError::MissingField("imagename".to_string()));
        }

        match self.partition_type.as_str() {
            "gpt" | "msdos" => {}
            "" => return Err(ActionError::MissingField("partitiontype".to_string())),
            other => {
                return Err(ActionError::ValidationFailed(format!(
                    "unsupported partition table type: {}. Valid options: gpt, msdos",
                    other
                )))
            }
        }

        if self.partitions.is_empty() {
            return Err(ActionError::ValidationFailed(
                "at least one partition is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for (idx, part) in self.partitions.iter_mut().enumerate() {
            part.number = idx + 1;

            if part.name.is_empty() {
                return Err(ActionError::MissingField(format!(
                    "name of partition {}",
                    part.number
                )));
            }
            if part.start.is_empty() {
                return Err(ActionError::MissingField(format!("start of partition {}", part.name)));
            }
            if part.end.is_empty() {
                return Err(ActionError::MissingField(format!("end of partition {}", part.name)));
            }
            if part.fs.is_empty() {
                return Err(ActionError::MissingField(format!("fs of partition {}", part.name)));
            }
            let (start, end) = (parse_offset(&part.start)?, parse_offset(&part.end)?);
            if !start.is_before(&end) {
                return Err(ActionError::ValidationFailed(format!(
                    "partition {} ends at {} before it starts at {}",
                    part.name, part.end, part.start
                )));
            }

            if !names.insert(part.name.clone()) {
                return Err(ActionError::ValidationFailed(format!(
                    "duplicate partition name: {}",
                    part.name
                )));
            }
        }

        for mount in self.mountpoints.iter_mut() {
            if mount.mountpoint.is_empty() {
                return Err(ActionError::MissingField(format!(
                    "mountpoint for partition {}",
                    mount.partition
                )));
            }
            let idx = self
                .partitions
                .iter()
                .position(|p| p.name == mount.partition)
                .ok_or_else(|| {
                    ActionError::ValidationFailed(format!(
                        "mountpoint {} references unknown partition {:?}",
                        mount.mountpoint, mount.partition
                    ))
                })?;
            mount.part = Some(idx);
        }

        if self.image_size.is_empty() {
            return Err(ActionError::MissingField("imagesize".to_string()));
        }
        self.size = parse_human_size(&self.image_size)?;

        debug!(
            image = %self.image_name,
            size = self.size,
            partitions = self.partitions.len(),
            "Partition layout verified"
        );
        Ok(())
    }

    async fn pre_machine(
        &mut self,
        ctx: &mut BuildContext,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let image = self.image_path(ctx);
        let target = MachineTargetProvider::new(machine)
            .acquire(&image, self.size)
            .await?;

        ctx.set_image(target.path());
        args.push("--internal-image".to_string());
        args.push(target.path().display().to_string());
        self.target = Some(target);
        Ok(())
    }

    async fn pre_no_machine(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let image = self.image_path(ctx);
        let target = LoopDeviceProvider::new(self.runner.clone())
            .acquire(&image, self.size)
            .await?;

        ctx.set_image(target.path());
        self.target = Some(target);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let target = ctx
            .image()
            .ok_or_else(|| ActionError::ValidationFailed("no block target was provisioned".to_string()))?
            .to_path_buf();

        info!(target = %target.display(), table = %self.partition_type, "Creating partition table");
        self.runner
            .run(
                "parted",
                &Invocation::new("parted")
                    .arg("-s")
                    .arg_path(&target)
                    .args(["mklabel", self.partition_type.as_str()]),
            )
            .await?;

        for idx in 0..self.partitions.len() {
            let part = &self.partitions[idx];
            let label = if self.partition_type == "gpt" {
                part.name.as_str()
            } else {
                "primary"
            };

            self.runner
                .run(
                    "parted",
                    &Invocation::new("parted")
                        .args(["-a", "none", "-s"])
                        .arg_path(&target)
                        .args(["mkpart", label, part.fs.as_str(), part.start.as_str(), part.end.as_str()]),
                )
                .await?;

            for flag in &part.flags {
                self.runner
                    .run(
                        "parted",
                        &Invocation::new("parted")
                            .arg("-s")
                            .arg_path(&target)
                            .arg("set")
                            .arg(part.number.to_string())
                            .args([flag.as_str(), "on"]),
                    )
                    .await?;
            }

            let uuid = self.format_partition(part, &target).await?;
            self.partitions[idx].fs_uuid = uuid;
        }

        let mnt_dir = ctx.scratchdir().join("mnt");
        tokio::fs::create_dir_all(&mnt_dir)
            .await
            .map_err(|e| ActionError::path("create mount root", &mnt_dir, e))?;
        ctx.set_image_mnt_dir(&mnt_dir);

        for mount in &self.mountpoints {
            let part = self.mounted_partition(mount)?;
            let device = partition_device_path(&target, part.number);
            let dir = match mount.mountpoint.trim_start_matches('/') {
                "" => mnt_dir.clone(),
                relative => mnt_dir.join(relative),
            };

            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ActionError::path("create mountpoint", &dir, e))?;
            self.runner
                .run(
                    &format!("mount {}", part.name),
                    &Invocation::new("mount")
                        .args(["-t", part.mount_fs()])
                        .arg_path(&device)
                        .arg_path(&dir),
                )
                .await?;
            info!(partition = %part.name, device = %device.display(), dir = %dir.display(), "Partition mounted");
            self.mounted.push(dir);
        }

        let fstab = self.generate_fstab()?;
        *ctx.image_fstab_mut() = fstab;

        if let Some(root) = self.kernel_root()? {
            debug!(param = %root, "Kernel root parameter");
            ctx.set_image_kernel_root(root);
        }

        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &BuildContext) -> Result<()> {
        let mut first_err = None;

        while let Some(dir) = self.mounted.pop() {
            let unmount = Invocation::new("umount").arg_path(&dir);
            match self.runner.run("umount", &unmount).await {
                Ok(_) => debug!(dir = %dir.display(), "Unmounted"),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to unmount");
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Some(target) = self.target.take() {
            if let Err(e) = target.release(self.runner.as_ref()).await {
                warn!(target = %target.path().display(), error = %e, "Failed to release block target");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Device path of partition `number` on the block device `base`
///
/// - `/dev/disk/by-id/<id>` names get `-partN`
/// - names ending in a digit get `pN` (`/dev/loop0p1`)
/// - anything else gets `N` (`/dev/sda1`)
pub fn partition_device_path(base: &Path, number: usize) -> PathBuf {
    let base = base.to_string_lossy();
    let suffix = if base.contains("/disk/by-id/") {
        "-part"
    } else if base.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    PathBuf::from(format!("{}{}{}", base, suffix, number))
}
