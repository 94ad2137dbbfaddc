//! Removal of credentials whose owners have no active scheduled work.

use std::io;
use std::path::Path;

use log::{debug, info, warn};
use thiserror::Error;

use crate::layout::{CredDir, DERIVED_EXT, remove_if_exists};
use crate::privilege::{PrivilegeError, PrivilegeGuard};
use crate::scheduler::{JobOwnerSource, OwnerQueryError};

/// Identity the reaper runs its file operations under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Raise effective ids to root for the removal phase.
    Root,
    /// Keep the daemon's current identity.
    Inherit,
}

#[derive(Debug, Error)]
pub enum ReapError {
    #[error("no local scheduler; reaping skipped")]
    Unavailable,

    #[error("querying active job owners: {0}")]
    Query(OwnerQueryError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error("listing {path}: {source}")]
    Listing {
        path: std::path::PathBuf,
        source: io::Error,
    },
}

impl From<OwnerQueryError> for ReapError {
    fn from(err: OwnerQueryError) -> Self {
        match err {
            OwnerQueryError::Unavailable => ReapError::Unavailable,
            other => ReapError::Query(other),
        }
    }
}

/// Outcome of one reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Users whose request and derived credential were removed.
    pub reaped: Vec<String>,
    pub markers_removed: usize,
    pub failures: usize,
}

pub struct Reaper {
    dir: CredDir,
    owners: Box<dyn JobOwnerSource>,
    elevation: Elevation,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("dir", &self.dir)
            .field("elevation", &self.elevation)
            .finish_non_exhaustive()
    }
}

impl Reaper {
    pub fn new(dir: CredDir, owners: Box<dyn JobOwnerSource>, elevation: Elevation) -> Self {
        Self {
            dir,
            owners,
            elevation,
        }
    }

    /// Delete `.cred`/`.cc` pairs for every requester without active jobs
    /// and purge all marker files.
    ///
    /// A failed owner query deletes nothing. Individual removal failures
    /// are counted and logged; the pass continues.
    pub async fn reap(&self) -> Result<ReapReport, ReapError> {
        let active = self.owners.active_owners().await?;
        debug!("{} active job owner(s)", active.len());

        let _guard = match self.elevation {
            Elevation::Root => PrivilegeGuard::elevate()?,
            Elevation::Inherit => PrivilegeGuard::inherit(),
        };

        let listing_err = |source| ReapError::Listing {
            path: self.dir.root().to_path_buf(),
            source,
        };
        // every request file counts, including names the cycle refuses to process
        let requests = self.dir.list_request_files().map_err(listing_err)?;
        let markers = self.dir.list_markers().map_err(listing_err)?;

        let mut report = ReapReport::default();
        for request in requests {
            if active.contains(&request.username) {
                continue;
            }
            let mut ok = true;
            let derived = request.path.with_extension(DERIVED_EXT);
            for path in [request.path.as_path(), derived.as_path()] {
                if !remove_logged(&path, &request.username) {
                    ok = false;
                    report.failures += 1;
                }
            }
            if ok {
                info!("{}: no active jobs, credentials removed", request.username);
                report.reaped.push(request.username);
            }
        }

        for marker in markers {
            match remove_if_exists(&marker) {
                Ok(()) => report.markers_removed += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!("failed to remove marker {}: {e}", marker.display());
                }
            }
        }

        Ok(report)
    }
}

fn remove_logged(path: &Path, username: &str) -> bool {
    match remove_if_exists(path) {
        Ok(()) => true,
        Err(e) => {
            warn!("{username}: failed to remove {}: {e}", path.display());
            false
        }
    }
}
