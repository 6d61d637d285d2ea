//! End-to-end pipeline runs against a recording command runner

use imgforge_actions::{
    BuildContext, BuildError, CommandOutput, Phase, Pipeline, Recipe, RecordingMachine,
    RecordingRunner,
};
use std::path::Path;
use std::sync::Arc;

const RECIPE: &str = r#"
architecture: arm64
actions:
  - action: image-partition
    imagename: debian-rpi3.img
    imagesize: 1GB
    partitiontype: gpt
    mountpoints:
      - mountpoint: /
        partition: root
      - mountpoint: /boot/firmware
        partition: firmware
        options: [ x-systemd.automount ]
    partitions:
      - name: firmware
        fs: fat32
        start: 0%
        end: 64MB
      - name: root
        fs: ext4
        start: 64MB
        end: 100%
        flags: [ boot ]
  - action: apt
    packages: [ systemd ]
"#;

fn runner() -> Arc<RecordingRunner> {
    Arc::new(RecordingRunner::with_responder(|inv| match inv.program() {
        "losetup" if inv.arguments()[0] == "-f" => CommandOutput::success("/dev/loop1\n"),
        "blkid" => {
            let device = inv.arguments().last().cloned().unwrap_or_default();
            CommandOutput::success(format!("uuid-of-{}\n", device.trim_start_matches("/dev/")))
        }
        _ => CommandOutput::success(""),
    }))
}

fn context(scratch: &Path) -> BuildContext {
    let artifacts = scratch.join("out");
    std::fs::create_dir_all(&artifacts).unwrap();
    BuildContext::new(scratch, artifacts, "/recipes", "arm64")
}

#[tokio::test]
async fn test_host_build_provisions_and_releases_loop_device() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner();
    let actions = Recipe::from_yaml(RECIPE)
        .unwrap()
        .into_actions_with_runner(runner.clone());
    let mut ctx = context(tmp.path());

    Pipeline::new(actions, "/recipes/rpi.yaml")
        .run(&mut ctx)
        .await
        .unwrap();

    let image = ctx.artifactdir().join("debian-rpi3.img");
    assert_eq!(std::fs::metadata(&image).unwrap().len(), 1_000_000_000);

    let lines = runner.command_lines();
    assert_eq!(lines[0], format!("losetup -f --show {}", image.display()));
    assert!(lines.contains(&"mkfs.vfat -n firmware /dev/loop1p1".to_string()));
    assert!(lines.contains(&"parted -s /dev/loop1 set 2 boot on".to_string()));

    // apt runs between provisioning and cleanup
    let apt = lines.iter().position(|l| l.contains("apt-get update")).unwrap();
    let last_mount = lines.iter().rposition(|l| l.starts_with("mount ")).unwrap();
    let first_umount = lines.iter().position(|l| l.starts_with("umount ")).unwrap();
    assert!(last_mount < apt && apt < first_umount);

    let mnt = tmp.path().join("mnt");
    assert_eq!(
        &lines[first_umount..],
        &[
            format!("umount {}", mnt.join("boot/firmware").display()),
            format!("umount {}", mnt.display()),
            "losetup -d /dev/loop1".to_string(),
        ]
    );

    assert_eq!(
        ctx.image_fstab(),
        "UUID=uuid-of-loop1p2\t/\text4\tdefaults\t0\t0\n\
         UUID=uuid-of-loop1p1\t/boot/firmware\tvfat\tdefaults,x-systemd.automount\t0\t0\n"
    );
    assert_eq!(ctx.image_kernel_root(), Some("root=UUID=uuid-of-loop1p2"));
}

#[tokio::test]
async fn test_machine_build_splits_work_between_instances() {
    let tmp = tempfile::tempdir().unwrap();

    // Outer instance: verify and request the machine disk only
    let outer_runner = runner();
    let machine = RecordingMachine::new();
    let mut outer_ctx = context(tmp.path());
    Pipeline::new(
        Recipe::from_yaml(RECIPE)
            .unwrap()
            .into_actions_with_runner(outer_runner.clone()),
        "/recipes/rpi.yaml",
    )
    .with_machine(Box::new(machine.clone()))
    .run(&mut outer_ctx)
    .await
    .unwrap();

    assert!(outer_runner.is_empty());
    let record = machine.record();
    let launch = &record.launches[0];
    let internal = launch.iter().position(|a| a == "--internal-image").unwrap();
    assert_eq!(launch[internal + 1], "/dev/vdb");

    // Inner instance: the disk is preset and owned by the machine
    let inner_runner = runner();
    let mut inner_ctx = context(tmp.path()).with_image(&launch[internal + 1]);
    Pipeline::new(
        Recipe::from_yaml(RECIPE)
            .unwrap()
            .into_actions_with_runner(inner_runner.clone()),
        "/recipes/rpi.yaml",
    )
    .inside_machine()
    .run(&mut inner_ctx)
    .await
    .unwrap();

    let lines = inner_runner.command_lines();
    assert_eq!(lines[0], "parted -s /dev/vdb mklabel gpt");
    assert!(lines.iter().all(|l| !l.starts_with("losetup")));
    assert_eq!(inner_ctx.image_kernel_root(), Some("root=UUID=uuid-of-vdb2"));
}

#[tokio::test]
async fn test_failing_install_releases_image() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::with_responder(|inv| match inv.program() {
        "losetup" if inv.arguments()[0] == "-f" => CommandOutput::success("/dev/loop1\n"),
        "blkid" => CommandOutput::success("0000-0000\n"),
        "chroot" => CommandOutput::failure(100, "E: Unable to fetch some archives"),
        _ => CommandOutput::success(""),
    }));
    let actions = Recipe::from_yaml(RECIPE)
        .unwrap()
        .into_actions_with_runner(runner.clone());
    let mut ctx = context(tmp.path());

    let err = Pipeline::new(actions, "/recipes/rpi.yaml")
        .run(&mut ctx)
        .await
        .unwrap_err();

    match &err {
        BuildError::Action { action, phase, .. } => {
            assert_eq!(action, "apt");
            assert_eq!(*phase, Phase::Run);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runner.command_lines().last().unwrap(), "losetup -d /dev/loop1");
}

#[tokio::test]
async fn test_invalid_recipe_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner();
    let recipe = RECIPE.replace("partition: firmware", "partition: efi");
    let actions = Recipe::from_yaml(&recipe)
        .unwrap()
        .into_actions_with_runner(runner.clone());
    let mut ctx = context(tmp.path());

    let err = Pipeline::new(actions, "/recipes/rpi.yaml")
        .run(&mut ctx)
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Verify));
    assert!(runner.is_empty());
    assert!(!ctx.artifactdir().join("debian-rpi3.img").exists());
}
