//! Atomic installation of derived credentials.
//!
//! Ownership and mode are fixed on the staging file first, then a single
//! `rename(2)` swaps it onto `<user>.cc`. Readers of the target path see
//! either the previous complete file or the new complete file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, fchown};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use thiserror::Error;

/// Final ownership and permission bits of an installed credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallPolicy {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl InstallPolicy {
    /// `root:root 0400`, used for ticket caches.
    pub fn root_read_only() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o400,
        }
    }

    /// Owned by the given identity, `0600`, used for tokens.
    pub fn owned_by(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            mode: 0o600,
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("staging file {path} is unusable: {source}")]
    Staging { path: PathBuf, source: io::Error },

    #[error("staging file {path} is empty")]
    EmptyStaging { path: PathBuf },

    #[error("chown {path} to {uid}:{gid}: {source}")]
    Chown {
        path: PathBuf,
        uid: u32,
        gid: u32,
        source: io::Error,
    },

    #[error("chmod {path} to {mode:o}: {source}")]
    Chmod {
        path: PathBuf,
        mode: u32,
        source: io::Error,
    },

    #[error("rename {from} -> {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Give `staging` its final ownership and mode without moving it.
///
/// Lets post-actions running as the credential's owner read the staging
/// file before it is promoted. On failure the staging file is removed.
pub fn prepare(username: &str, staging: &Path, policy: InstallPolicy) -> Result<(), InstallError> {
    settle(username, staging, apply_policy(staging, policy))
}

/// Promote `staging` to `target` for `username`.
///
/// Ownership and mode are (re)applied before the rename, so a staging
/// file that went through [`prepare`] is checked again. On failure the
/// staging file is removed and any existing target is left exactly as
/// it was.
pub fn install(
    username: &str,
    staging: &Path,
    target: &Path,
    policy: InstallPolicy,
) -> Result<(), InstallError> {
    let result = apply_policy(staging, policy).and_then(|()| {
        fs::rename(staging, target).map_err(|source| InstallError::Rename {
            from: staging.to_path_buf(),
            to: target.to_path_buf(),
            source,
        })
    });
    settle(username, staging, result)?;
    debug!(
        "installed credential for {username} at {} ({}:{} {:o})",
        target.display(),
        policy.uid,
        policy.gid,
        policy.mode
    );
    Ok(())
}

/// Log a failed step and drop the staging file.
fn settle(
    username: &str,
    staging: &Path,
    result: Result<(), InstallError>,
) -> Result<(), InstallError> {
    if let Err(e) = &result {
        error!("failed to install credential for {username}: {e}");
        if let Err(rm) = crate::layout::remove_if_exists(staging) {
            warn!(
                "failed to remove staging file {} for {username}: {rm}",
                staging.display()
            );
        }
    }
    result
}

fn apply_policy(staging: &Path, policy: InstallPolicy) -> Result<(), InstallError> {
    let file = open_staging(staging)?;

    fchown(&file, Some(policy.uid), Some(policy.gid)).map_err(|source| InstallError::Chown {
        path: staging.to_path_buf(),
        uid: policy.uid,
        gid: policy.gid,
        source,
    })?;

    file.set_permissions(fs::Permissions::from_mode(policy.mode))
        .map_err(|source| InstallError::Chmod {
            path: staging.to_path_buf(),
            mode: policy.mode,
            source,
        })?;

    file.sync_all().map_err(|source| InstallError::Staging {
        path: staging.to_path_buf(),
        source,
    })
}

/// Open the staging file without following symlinks and check it holds data.
fn open_staging(staging: &Path) -> Result<File, InstallError> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(staging)
        .map_err(|source| InstallError::Staging {
            path: staging.to_path_buf(),
            source,
        })?;
    let meta = file.metadata().map_err(|source| InstallError::Staging {
        path: staging.to_path_buf(),
        source,
    })?;
    if !meta.is_file() {
        return Err(InstallError::Staging {
            path: staging.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }
    if meta.len() == 0 {
        return Err(InstallError::EmptyStaging {
            path: staging.to_path_buf(),
        });
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::real_ids;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn own_policy(mode: u32) -> InstallPolicy {
        let (uid, gid) = real_ids();
        InstallPolicy { uid, gid, mode }
    }

    #[test]
    fn test_install_sets_mode_and_replaces_target() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("alice.cc.tmp");
        let target = tmp.path().join("alice.cc");
        fs::write(&target, b"old").unwrap();
        fs::write(&staging, b"new ticket").unwrap();

        install("alice", &staging, &target, own_policy(0o400)).unwrap();

        assert!(!staging.exists());
        let meta = fs::metadata(&target).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o400);
        assert_eq!(meta.uid(), real_ids().0);
        assert_eq!(fs::read(&target).unwrap(), b"new ticket");
    }

    #[test]
    fn test_prepare_sets_mode_in_place() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("alice.cc.tmp");
        fs::write(&staging, b"token").unwrap();
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o644)).unwrap();

        prepare("alice", &staging, own_policy(0o600)).unwrap();

        let meta = fs::metadata(&staging).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(meta.uid(), real_ids().0);
        assert!(!tmp.path().join("alice.cc").exists());

        let target = tmp.path().join("alice.cc");
        install("alice", &staging, &target, own_policy(0o600)).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"token");
    }

    #[test]
    fn test_prepare_failure_removes_staging() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("alice.cc.tmp");
        fs::write(&staging, b"").unwrap();
        let err = prepare("alice", &staging, own_policy(0o600)).unwrap_err();
        assert!(matches!(err, InstallError::EmptyStaging { .. }));
        assert!(!staging.exists());
    }

    #[test]
    fn test_missing_staging_leaves_target() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("alice.cc");
        fs::write(&target, b"old").unwrap();

        let err = install(
            "alice",
            &tmp.path().join("alice.cc.tmp"),
            &target,
            own_policy(0o400),
        )
        .unwrap_err();
        assert!(matches!(err, InstallError::Staging { .. }));
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn test_empty_staging_rejected_and_removed() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("alice.cc.tmp");
        let target = tmp.path().join("alice.cc");
        fs::write(&staging, b"").unwrap();

        let err = install("alice", &staging, &target, own_policy(0o400)).unwrap_err();
        assert!(matches!(err, InstallError::EmptyStaging { .. }));
        assert!(!staging.exists());
        assert!(!target.exists());
    }

    #[test]
    fn test_symlinked_staging_rejected() {
        let tmp = TempDir::new().unwrap();
        let victim = tmp.path().join("victim");
        fs::write(&victim, b"do not chmod me").unwrap();
        let staging = tmp.path().join("alice.cc.tmp");
        std::os::unix::fs::symlink(&victim, &staging).unwrap();

        let target = tmp.path().join("alice.cc");
        assert!(install("alice", &staging, &target, own_policy(0o400)).is_err());
        assert!(!target.exists());
        assert_ne!(fs::metadata(&victim).unwrap().mode() & 0o777, 0o400);
    }

    #[test]
    fn test_concurrent_reader_never_sees_partial_file() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("alice.cc");
        let old = vec![b'a'; 64 * 1024];
        let new = vec![b'b'; 64 * 1024];
        fs::write(&target, &old).unwrap();

        let reader_target = target.clone();
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader_stop = stop.clone();
        let reader = std::thread::spawn(move || {
            let mut observed = 0usize;
            while !reader_stop.load(std::sync::atomic::Ordering::Relaxed) {
                if let Ok(bytes) = fs::read(&reader_target) {
                    assert_eq!(bytes.len(), 64 * 1024, "partial credential observed");
                    assert!(bytes.iter().all(|b| *b == bytes[0]), "mixed credential");
                    observed += 1;
                }
            }
            observed
        });

        for round in 0..50 {
            let staging = tmp.path().join("alice.cc.tmp");
            let body = if round % 2 == 0 { &new } else { &old };
            fs::write(&staging, body).unwrap();
            install("alice", &staging, &target, own_policy(0o600)).unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(reader.join().unwrap() > 0);
    }
}
