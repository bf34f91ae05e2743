//! Loop device lifecycle backed by the `losetup` host executable.
//!
//! Grounded on the Command-wrapper idiom in `findmnt.rs`/`format.rs`: shell
//! out, capture stdout, parse. `losetup` is used rather than the `loopdev`
//! FFI crate or raw `LOOP_*` ioctls because the teacher's own device code
//! already favours wrapping host tooling over hand-rolled ioctl plumbing
//! for anything beyond the NVMe/iSCSI fast path.

use crate::error::EngineError;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Deserialize)]
struct LosetupList {
    loopdevices: Vec<LoopDevice>,
}

#[derive(Debug, Deserialize)]
struct LoopDevice {
    name: String,
    #[serde(rename = "back-file")]
    back_file: String,
}

/// Find the loop device currently backed by `image_path`, if any.
pub fn find_backing(image_path: &Path) -> Result<Option<String>, EngineError> {
    let output = Command::new("losetup")
        .args(&["--json", "-a"])
        .output()
        .map_err(|_| EngineError::missing_tool("losetup_find", "losetup"))?;

    if !output.status.success() {
        return Err(EngineError::new(
            "losetup_find",
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let parsed: LosetupList = serde_json::from_slice(&output.stdout)?;
    let target = image_path.to_string_lossy();
    Ok(parsed
        .loopdevices
        .into_iter()
        .find(|d| d.back_file == target)
        .map(|d| d.name))
}

/// Attach `image_path` to a free loop device and return its path, e.g.
/// `/dev/loop3`. Idempotent: if the image is already attached, returns the
/// existing device instead of creating a duplicate attachment.
pub fn attach(image_path: &Path, direct_io: bool) -> Result<String, EngineError> {
    if let Some(existing) = find_backing(image_path)? {
        return Ok(existing);
    }

    let mut command = Command::new("losetup");
    command.arg("-f").arg("--show");
    if direct_io {
        command.arg("--direct-io=on");
    }
    command.arg(image_path);

    let output = command
        .output()
        .map_err(|_| EngineError::missing_tool("losetup_attach", "losetup"))?;
    if !output.status.success() {
        return Err(EngineError::new(
            "losetup_attach",
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

/// Detach a loop device. Not an error if it is already gone.
pub fn detach(device_path: &str) -> Result<(), EngineError> {
    let output = Command::new("losetup")
        .args(&["-d", device_path])
        .output()
        .map_err(|_| EngineError::missing_tool("losetup_detach", "losetup"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such device") {
            return Ok(());
        }
        return Err(EngineError::new("losetup_detach", stderr.to_string()));
    }
    Ok(())
}

/// Ask the kernel to reread the backing file's size after it has grown,
/// so the loop device's reported size matches the new image length.
pub fn reread_capacity(device_path: &str) -> Result<(), EngineError> {
    let output = Command::new("losetup")
        .args(&["-c", device_path])
        .output()
        .map_err(|_| EngineError::missing_tool("losetup_resize", "losetup"))?;
    if !output.status.success() {
        return Err(EngineError::new(
            "losetup_resize",
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}
