//! Bind-mount plumbing for published volumes
//!
//! The kubelet hands us a target path inside the Pod's volume directory; we
//! bind-mount the volume's data directory onto it so rotations performed in
//! the store become visible to the workload without remounting.

use std::io::BufRead;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::debug;

use spiffe_common::{Error, Result};

/// Bind-mount `source` onto `target`, creating the target directory if
/// needed. With `readonly`, the bind is remounted read-only afterwards.
/// A target that is already a mount point is left alone.
pub fn publish(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    std::fs::create_dir_all(target)
        .map_err(|e| Error::internal_with_context("mount", format!("creating target path: {e}")))?;

    if is_mount_point(target)? {
        debug!(target = %target.display(), "target already mounted");
        return Ok(());
    }

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::internal_with_context(
            "mount",
            format!("bind mounting {} to {}: {e}", source.display(), target.display()),
        )
    })?;

    if readonly {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| {
            Error::internal_with_context(
                "mount",
                format!("remounting {} read-only: {e}", target.display()),
            )
        })?;
    }

    debug!(source = %source.display(), target = %target.display(), readonly, "published volume mount");
    Ok(())
}

/// Unmount a published target and remove the now-empty directory. Both
/// steps tolerate the state already being torn down.
pub fn unpublish(target: &Path) -> Result<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {
            // Not mounted (driver restart) or already gone.
        }
        Err(e) => {
            return Err(Error::internal_with_context(
                "mount",
                format!("unmounting {}: {e}", target.display()),
            ));
        }
    }

    if let Err(e) = std::fs::remove_dir(target) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(target = %target.display(), error = %e, "leaving target path behind");
        }
    }

    Ok(())
}

/// Whether the path is currently a mount point, per /proc/self/mountinfo.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let file = match std::fs::File::open("/proc/self/mountinfo") {
        Ok(file) => file,
        Err(e) => {
            return Err(Error::internal_with_context(
                "mount",
                format!("reading mountinfo: {e}"),
            ))
        }
    };

    let needle = path.to_string_lossy();
    for line in std::io::BufReader::new(file).lines() {
        let line = line
            .map_err(|e| Error::internal_with_context("mount", format!("reading mountinfo: {e}")))?;
        // Field 5 of mountinfo is the mount point; octal escapes cover
        // spaces in paths, which volume targets never contain.
        if line.split(' ').nth(4) == Some(needle.as_ref()) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")).unwrap());
    }

    #[test]
    fn fresh_directory_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()).unwrap());
    }

    #[test]
    fn unpublish_tolerates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        assert!(unpublish(&target).is_ok());
    }
}
