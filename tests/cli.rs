use assert_cmd::prelude::*;
use color_eyre::Result;
use std::process::Command;

#[test]
fn test_help_lists_options() -> Result<()> {
    let output = Command::cargo_bin("imgforge")?.arg("--help").output()?;

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: imgforge [OPTIONS] <RECIPE>"), "unexpected help: {}", stdout);
    for option in [
        "--artifactdir",
        "--scratchdir",
        "--build-storage",
        "--build-storage-size",
        "--disable-machine",
        "--debug-shell",
        "--shell",
        "--verbose",
    ] {
        assert!(stdout.contains(option), "missing {} in help", option);
    }
    assert!(!stdout.contains("--internal-image"), "internal option should be hidden");

    Ok(())
}

#[test]
fn test_missing_recipe_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    Command::cargo_bin("imgforge")?
        .current_dir(tmp.path())
        .arg("nonexistent.yaml")
        .assert()
        .failure();

    Ok(())
}

#[test]
fn test_invalid_image_size_fails_before_touching_disk() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let recipe = tmp.path().join("bad.yaml");
    std::fs::write(
        &recipe,
        "architecture: amd64\n\
         actions:\n\
         \x20 - action: image-partition\n\
         \x20   imagename: disk.img\n\
         \x20   imagesize: huge\n\
         \x20   partitiontype: gpt\n\
         \x20   partitions:\n\
         \x20     - { name: root, fs: ext4, start: 0%, end: 100% }\n",
    )?;

    let output = Command::cargo_bin("imgforge")?
        .current_dir(tmp.path())
        .arg(&recipe)
        .output()?;

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed at stage Verify"), "unexpected stderr: {}", stderr);
    assert!(!tmp.path().join("disk.img").exists());

    Ok(())
}

#[test]
fn test_invalid_build_storage_size_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let output = Command::cargo_bin("imgforge")?
        .current_dir(tmp.path())
        .args(["--build-storage", ".", "--build-storage-size", "lots", "recipe.yaml"])
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid --build-storage-size"), "unexpected stderr: {}", stderr);

    Ok(())
}
