//! Mount Manager: sole owner of mount/unmount/is-mounted over the kernel
//! mount table. Every operation here is idempotent.
//!
//! Ground: `sys_mount`-based mounting/unmounting follows the teacher's own
//! `filesystem_mount`/`bind_mount`/`filesystem_unmount`/`bind_unmount`
//! shape verbatim; the read-only query half is layered on `findmnt.rs`.

use crate::error::{CsiError, EngineError};
use crate::findmnt;
use std::os::unix::fs::DirBuilderExt;
use sys_mount::{unmount as sys_unmount, FilesystemType, Mount, MountFlags, UnmountFlags};

const SHARED_PROPAGATION: &str = "shared";

/// Supported filesystem types for format/mount. Only the default journaled
/// extent filesystem is supported in v1 (spec.md §1 Non-goals, §4.1
/// "Format-if-needed" — `unsupported_fs` if the requested type differs).
pub fn probe_filesystems() -> Vec<String> {
    vec![String::from("ext4")]
}

fn option(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn join_options(options: &[String]) -> (bool, String) {
    let mut list: Vec<&str> = Vec::new();
    let mut readonly = false;
    for entry in options {
        match entry.as_str() {
            "ro" => readonly = true,
            "rw" => {}
            other => list.push(other),
        }
    }
    (readonly, list.join(","))
}

/// Query whether `target` is a mount point with `shared` propagation.
/// Returns `false` when the query tool reports nothing found, even via a
/// non-zero exit with empty output (ground: findmnt.rs's own handling of a
/// no-match exit code).
///
/// Any entry whose propagation is not `shared` is a structured error: the
/// driver depends on bidirectional propagation into the orchestrator's
/// mount namespace (spec §9 "Mount propagation").
pub fn is_mounted(target: &str) -> Result<bool, CsiError> {
    let entries = findmnt::entries_for_target(target)?;
    let matching: Vec<_> = entries.into_iter().filter(|e| e.target == target).collect();

    if matching.is_empty() {
        return Ok(false);
    }

    for entry in &matching {
        if entry.propagation != SHARED_PROPAGATION {
            return Err(CsiError::from(EngineError::new(
                "is_mounted",
                format!(
                    "mount {} has propagation {:?}, expected {:?}",
                    target, entry.propagation, SHARED_PROPAGATION
                ),
            )));
        }
    }

    Ok(true)
}

/// Mount `source` at `target` with `options` (joined comma-separated). If
/// `target` is already mounted with shared propagation, succeed without
/// remounting. Creates `target` (mode 0750, including parents) if absent.
pub fn mount(
    source: &str,
    target: &str,
    fstype: &str,
    options: &[String],
) -> Result<(), CsiError> {
    if source.is_empty() || target.is_empty() {
        return Err(CsiError::invalid_argument(
            "mount source and target must not be empty",
        ));
    }

    if is_mounted(target)? {
        return Ok(());
    }

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(target)
        .map_err(|e| CsiError::from(EngineError::from(e)))?;

    let (readonly, joined) = join_options(options);
    let mut flags = MountFlags::empty();
    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    Mount::new(
        source,
        target,
        FilesystemType::Manual(fstype),
        flags,
        option(&joined),
    )
    .map_err(|e| CsiError::from(EngineError::from(e)))?;

    tracing::debug!(source, target, fstype, "mounted filesystem");
    Ok(())
}

/// Bind-mount `staging_path` onto `target_path`, appending `ro` when
/// requested and any caller-provided mount flags.
pub fn bind_mount(
    staging_path: &str,
    target_path: &str,
    readonly: bool,
    options: &[String],
) -> Result<(), CsiError> {
    if staging_path.is_empty() || target_path.is_empty() {
        return Err(CsiError::invalid_argument(
            "bind mount source and target must not be empty",
        ));
    }

    if is_mounted(target_path)? {
        return Ok(());
    }

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(target_path)
        .map_err(|e| CsiError::from(EngineError::from(e)))?;

    let mut flags = MountFlags::empty();
    flags.insert(MountFlags::BIND);
    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    let (_, joined) = join_options(options);

    Mount::new(
        staging_path,
        target_path,
        FilesystemType::Manual("none"),
        flags,
        option(&joined),
    )
    .map_err(|e| CsiError::from(EngineError::from(e)))?;

    tracing::debug!(staging_path, target_path, "bind mounted");
    Ok(())
}

/// Unmount `target`. Succeeds without error if `target` is not currently a
/// mount.
pub fn unmount(target: &str) -> Result<(), CsiError> {
    if !is_mounted(target)? {
        return Ok(());
    }

    let mut flags = UnmountFlags::empty();
    flags.insert(UnmountFlags::DETACH);
    sys_unmount(target, flags).map_err(|e| CsiError::from(EngineError::from(e)))?;

    tracing::debug!(target, "unmounted");
    Ok(())
}
