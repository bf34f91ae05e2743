//! Image Controller: lifecycle of sparse images and their loop
//! associations, filesystem creation and online growth, and capacity
//! accounting.
//!
//! Authoritative state lives in the kernel and on disk; this module keeps
//! no registry of its own and re-derives everything from the filesystem,
//! `losetup` and `blkid` on every call (spec.md §9 "Authoritative state
//! lives in the kernel").

use crate::error::{CsiError, EngineError};
use crate::losetup;
use nix::sys::statvfs::statvfs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct VolumeStats {
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_inodes: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
}

/// Engine wrapping a single images directory.
#[derive(Clone)]
pub struct ImageController {
    images_dir: PathBuf,
    direct_io: bool,
}

impl ImageController {
    pub fn new(images_dir: impl Into<PathBuf>, direct_io: bool) -> Self {
        Self {
            images_dir: images_dir.into(),
            direct_io,
        }
    }

    fn image_path(&self, id: &str) -> PathBuf {
        self.images_dir.join(format!("{}.img", id))
    }

    /// Create a sparse image of exactly `size` bytes. Idempotent: an
    /// existing image is left untouched (spec.md §4.1 "Create", I5).
    pub fn create(&self, id: &str, size: u64) -> Result<(), CsiError> {
        let path = self.image_path(id);
        if path.exists() {
            return Ok(());
        }

        let result = (|| -> Result<(), EngineError> {
            let file = File::create(&path)?;
            file.set_len(size)?;
            Ok(())
        })();

        if let Err(error) = result {
            let _ = std::fs::remove_file(&path);
            return Err(error.into());
        }

        tracing::info!(id, size, "created sparse image");
        Ok(())
    }

    /// Remove the image file if present. Does not require the caller to
    /// have detached first — the orchestrator is expected to call
    /// `NodeUnstageVolume` before deleting, but a lingering loop device is
    /// tolerated and left alone: the device may still be mounted at a
    /// staging path, and tearing it down here would fail with EBUSY and
    /// turn a tolerable delete into an `internal` error (spec.md §4.1
    /// "Delete", §9 open question, §8 scenario 6).
    pub fn delete(&self, id: &str) -> Result<(), CsiError> {
        let path = self.image_path(id);

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(id, "deleted image");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::from(e).into()),
        }
    }

    /// Current logical length of the image file, in bytes.
    pub fn volume_size(&self, id: &str) -> Result<u64, CsiError> {
        let path = self.image_path(id);
        let metadata = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CsiError::not_found(format!("volume {} not found", id))
            } else {
                CsiError::from(EngineError::from(e))
            }
        })?;
        Ok(metadata.len())
    }

    /// Free bytes available on the filesystem backing the images
    /// directory.
    pub fn pool_capacity(&self) -> Result<u64, CsiError> {
        let stats = statvfs(&self.images_dir).map_err(EngineError::from)?;
        Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
    }

    /// Usage statistics (bytes and inodes) for the filesystem mounted at
    /// `path`.
    pub fn volume_stats(&self, path: &str) -> Result<VolumeStats, CsiError> {
        let stats = statvfs(Path::new(path)).map_err(EngineError::from)?;
        let block_size = stats.fragment_size() as u64;
        let total_bytes = stats.blocks() as u64 * block_size;
        let available_bytes = stats.blocks_available() as u64 * block_size;
        Ok(VolumeStats {
            available_bytes,
            total_bytes,
            used_bytes: total_bytes.saturating_sub(available_bytes),
            available_inodes: stats.files_available() as u64,
            total_inodes: stats.files() as u64,
            used_inodes: (stats.files() as u64).saturating_sub(stats.files_available() as u64),
        })
    }

    /// Grow the image to at least `new_size` bytes. No-op if already
    /// large enough. Fails with `resource_exhausted` if the grow delta
    /// would meet or exceed pool free space (spec.md §4.1 "Expand").
    pub fn expand(&self, id: &str, new_size: u64) -> Result<u64, CsiError> {
        let current = self.volume_size(id)?;
        if new_size <= current {
            return Ok(current);
        }

        let delta = new_size - current;
        let free = self.pool_capacity()?;
        if delta >= free {
            return Err(CsiError::resource_exhausted(format!(
                "expanding volume {} by {} bytes would exceed pool free space {}",
                id, delta, free
            )));
        }

        let path = self.image_path(id);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(EngineError::from)?;
        file.set_len(new_size).map_err(EngineError::from)?;

        tracing::info!(id, new_size, "expanded image");
        Ok(new_size)
    }

    /// Look up the loop device currently bound to the image, if any.
    pub fn device_of(&self, id: &str) -> Result<Option<String>, CsiError> {
        if !self.image_path(id).exists() {
            return Err(CsiError::not_found(format!("volume {} not found", id)));
        }
        Ok(losetup::find_backing(&self.image_path(id)).map_err(CsiError::from)?)
    }

    /// Bind the image to a loop device, creating the association if one
    /// does not already exist (spec.md §4.1 "Attach").
    pub fn attach(&self, id: &str) -> Result<String, CsiError> {
        let path = self.image_path(id);
        if !path.exists() {
            return Err(CsiError::not_found(format!("volume {} not found", id)));
        }
        let device = losetup::attach(&path, self.direct_io).map_err(CsiError::from)?;
        tracing::info!(id, device, "attached loop device");
        Ok(device)
    }

    /// Tear down the loop association for the image. Success if already
    /// detached, and success if the image file itself is already gone
    /// (spec.md §4.1 "Detach") — the kernel loop association, not the
    /// file, is authoritative here, so `NodeUnstageVolume` can detach
    /// cleanly after a `DeleteVolume` has already unlinked the image.
    pub fn detach(&self, id: &str) -> Result<(), CsiError> {
        match losetup::find_backing(&self.image_path(id)).map_err(CsiError::from)? {
            Some(device) => {
                losetup::detach(&device).map_err(CsiError::from)?;
                tracing::info!(id, device, "detached loop device");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Probe the image's filesystem type; if absent, format with `fs`.
    /// Only one filesystem type is supported at a time per image (spec.md
    /// §4.1 "Format-if-needed").
    pub fn format_if_needed(&self, id: &str, fs: &str) -> Result<(), CsiError> {
        let path = self.image_path(id);
        if !path.exists() {
            return Err(CsiError::not_found(format!("volume {} not found", id)));
        }

        if let Some(existing) = probe_fstype(&path).map_err(CsiError::from)? {
            if existing == fs {
                return Ok(());
            }
        }

        let output = Command::new(format!("mkfs.{}", fs))
            .arg(&path)
            .output()
            .map_err(|_| CsiError::from(EngineError::missing_tool("mkfs", "mkfs.*")))?;
        if !output.status.success() {
            return Err(CsiError::from(EngineError::new(
                "mkfs",
                String::from_utf8_lossy(&output.stderr).to_string(),
            )));
        }

        tracing::info!(id, fs, "formatted image");
        Ok(())
    }

    /// Resolve the current loop device, force it to reread the backing
    /// file's new size, then invoke the filesystem's online-resize tool
    /// (spec.md §4.1 "Resize filesystem").
    pub fn resize_fs(&self, id: &str) -> Result<(), CsiError> {
        let device = self
            .device_of(id)?
            .ok_or_else(|| CsiError::not_found(format!("volume {} has no loop device", id)))?;

        losetup::reread_capacity(&device).map_err(CsiError::from)?;

        let output = Command::new("resize2fs")
            .arg(&device)
            .output()
            .map_err(|_| CsiError::from(EngineError::missing_tool("resize_fs", "resize2fs")))?;
        if !output.status.success() {
            return Err(CsiError::from(EngineError::new(
                "resize_fs",
                String::from_utf8_lossy(&output.stderr).to_string(),
            )));
        }

        tracing::info!(id, device, "grew filesystem to device size");
        Ok(())
    }
}

fn probe_fstype(image_path: &Path) -> Result<Option<String>, EngineError> {
    let output = Command::new("blkid")
        .args(&["-o", "value", "-s", "TYPE"])
        .arg(image_path)
        .output()
        .map_err(|_| EngineError::missing_tool("blkid", "blkid"))?;

    // blkid exits 2 with empty stdout when no filesystem is present.
    if output.stdout.is_empty() {
        return Ok(None);
    }
    let fstype = String::from_utf8(output.stdout)?.trim().to_string();
    if fstype.is_empty() {
        Ok(None)
    } else {
        Ok(Some(fstype))
    }
}
