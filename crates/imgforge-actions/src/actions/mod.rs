//! Build actions available to recipes
//!
//! # Available Actions
//!
//! - `image-partition` - Create, partition, format and mount a disk image
//! - `apt` - Install packages into the target root

mod apt;
mod partition;

pub use apt::{allow_services, deny_services, AptAction, POLICY_HELPER};
pub use partition::{partition_device_path, ImagePartitionAction, Mountpoint, Partition};
