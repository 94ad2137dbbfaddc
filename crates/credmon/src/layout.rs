//! On-disk layout of the credential directory.
//!
//! ```text
//! <cred_dir>/
//!   alice.cred          opaque request, written by an unprivileged producer
//!   alice.cc            derived credential, written only by the installer
//!   alice.cc.tmp        ticket staging file (transient)
//!   .alice.cc.XXXX.tmp  token staging file (transient)
//!   *.mark              collaborator markers, purged each cycle
//!   pid                 daemon pid
//!   CREDMON_COMPLETE    present once a full scan cycle has finished
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::validate::validate_username;

/// Extension of opaque credential request files.
pub const REQUEST_EXT: &str = "cred";

/// Extension of derived credential files.
pub const DERIVED_EXT: &str = "cc";

/// Extension of collaborator marker files.
pub const MARKER_EXT: &str = "mark";

/// Suffix of ticket staging files (`<user>.cc.tmp`).
pub const STAGING_SUFFIX: &str = ".cc.tmp";

/// Name of the completion sentinel.
pub const COMPLETION_FLAG: &str = "CREDMON_COMPLETE";

/// Name of the pid file.
pub const PID_FILE: &str = "pid";

/// Name of the directory-local fallback log file.
pub const LOG_FILE: &str = "credmon.log";

/// A `<username>.cred` file found during listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub username: String,
    pub path: PathBuf,
}

/// Handle on the credential directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CredDir {
    root: PathBuf,
}

impl CredDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn request_path(&self, username: &str) -> PathBuf {
        self.root.join(format!("{username}.{REQUEST_EXT}"))
    }

    pub fn derived_path(&self, username: &str) -> PathBuf {
        self.root.join(format!("{username}.{DERIVED_EXT}"))
    }

    pub fn staging_path(&self, username: &str) -> PathBuf {
        self.root.join(format!("{username}{STAGING_SUFFIX}"))
    }

    pub fn completion_flag(&self) -> PathBuf {
        self.root.join(COMPLETION_FLAG)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Create the directory if missing and make sure it is a directory.
    pub fn ensure(&self) -> io::Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.root, fs::Permissions::from_mode(0o755))?;
            }
        }
        let meta = fs::metadata(&self.root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", self.root.display()),
            ));
        }
        Ok(())
    }

    /// Enumerate `*.cred` files. Entries with invalid usernames are skipped.
    pub fn list_requests(&self) -> io::Result<Vec<CredentialRequest>> {
        let mut requests = Vec::new();
        for request in self.list_request_files()? {
            if let Err(e) = validate_username(&request.username) {
                warn!("skipping request {}: {e}", request.path.display());
                continue;
            }
            requests.push(request);
        }
        Ok(requests)
    }

    /// Enumerate every `*.cred` file, whatever its stem.
    ///
    /// `username` is the lossy stem and must not be used to build paths;
    /// `path` is the entry as read from the directory.
    pub fn list_request_files(&self) -> io::Result<Vec<CredentialRequest>> {
        let mut requests = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("skipping unreadable directory entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REQUEST_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem() else {
                continue;
            };
            requests.push(CredentialRequest {
                username: stem.to_string_lossy().into_owned(),
                path,
            });
        }
        Ok(requests)
    }

    /// Enumerate `*.mark` files.
    pub fn list_markers(&self) -> io::Result<Vec<PathBuf>> {
        let mut markers = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(MARKER_EXT) {
                markers.push(path);
            }
        }
        Ok(markers)
    }

    /// Read the opaque credential behind a request.
    ///
    /// Returns `Ok(None)` when the file vanished after listing.
    pub fn read_request(&self, request: &CredentialRequest) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&request.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn clear_completion_flag(&self) -> io::Result<()> {
        remove_if_exists(&self.completion_flag())
    }

    pub fn mark_complete(&self) -> io::Result<()> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.completion_flag())?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.completion_flag().exists()
    }

    /// Rewrite the pid file with `pid`.
    pub fn write_pid_file(&self, pid: u32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.pid_file())?;
        writeln!(file, "{pid}")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.pid_file(), fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }

    /// Remove staging leftovers from an interrupted run. Returns the count.
    pub fn remove_stale_staging(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)?.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_staging_name(name) {
                continue;
            }
            match remove_if_exists(&entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to remove stale staging file {name}: {e}"),
            }
        }
        Ok(removed)
    }
}

/// `<user>.cc.tmp` (ticket) or `.<user>.cc.<random>.tmp` (token).
fn is_staging_name(name: &str) -> bool {
    if let Some(user) = name.strip_suffix(STAGING_SUFFIX) {
        return !user.is_empty();
    }
    let Some(inner) = name.strip_prefix('.').and_then(|n| n.strip_suffix(".tmp")) else {
        return false;
    };
    match inner.rsplit_once(".cc.") {
        Some((user, random)) => {
            !user.is_empty()
                && !random.is_empty()
                && random.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_paths_follow_naming_scheme() {
        let dir = CredDir::new("/var/lib/credmon");
        assert_eq!(
            dir.request_path("alice"),
            PathBuf::from("/var/lib/credmon/alice.cred")
        );
        assert_eq!(
            dir.derived_path("alice"),
            PathBuf::from("/var/lib/credmon/alice.cc")
        );
        assert_eq!(
            dir.staging_path("alice"),
            PathBuf::from("/var/lib/credmon/alice.cc.tmp")
        );
        assert_eq!(
            dir.completion_flag(),
            PathBuf::from("/var/lib/credmon/CREDMON_COMPLETE")
        );
    }

    #[test]
    fn test_list_requests_filters_extension_and_invalid_names() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "alice.cred");
        touch(tmp.path(), "bob.cred");
        touch(tmp.path(), "alice.cc");
        touch(tmp.path(), "Evil Name.cred");
        touch(tmp.path(), "x.mark");

        let dir = CredDir::new(tmp.path());
        let mut names: Vec<String> = dir
            .list_requests()
            .unwrap()
            .into_iter()
            .map(|r| r.username)
            .collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn test_list_request_files_keeps_invalid_names() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "alice.cred");
        touch(tmp.path(), "Evil Name.cred");
        touch(tmp.path(), "alice.cc");

        let dir = CredDir::new(tmp.path());
        let mut files: Vec<PathBuf> = dir
            .list_request_files()
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                tmp.path().join("Evil Name.cred"),
                tmp.path().join("alice.cred")
            ]
        );
    }

    #[test]
    fn test_read_request_vanished_is_none() {
        let tmp = TempDir::new().unwrap();
        let dir = CredDir::new(tmp.path());
        let request = CredentialRequest {
            username: "ghost".into(),
            path: dir.request_path("ghost"),
        };
        assert_eq!(dir.read_request(&request).unwrap(), None);
    }

    #[test]
    fn test_completion_flag_toggle() {
        let tmp = TempDir::new().unwrap();
        let dir = CredDir::new(tmp.path());
        assert!(!dir.is_complete());
        dir.mark_complete().unwrap();
        assert!(dir.is_complete());
        dir.clear_completion_flag().unwrap();
        assert!(!dir.is_complete());
        // clearing twice is fine
        dir.clear_completion_flag().unwrap();
    }

    #[test]
    fn test_pid_file_rewritten() {
        let tmp = TempDir::new().unwrap();
        let dir = CredDir::new(tmp.path());
        dir.write_pid_file(1234).unwrap();
        dir.write_pid_file(42).unwrap();
        assert_eq!(fs::read_to_string(dir.pid_file()).unwrap(), "42\n");
    }

    #[test]
    fn test_remove_stale_staging() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "alice.cc.tmp");
        touch(tmp.path(), ".bob.cc.a1b2c3.tmp");
        touch(tmp.path(), "alice.cc");
        touch(tmp.path(), "alice.cred");

        let dir = CredDir::new(tmp.path());
        assert_eq!(dir.remove_stale_staging().unwrap(), 2);
        assert!(tmp.path().join("alice.cc").exists());
        assert!(tmp.path().join("alice.cred").exists());
        assert!(!tmp.path().join("alice.cc.tmp").exists());
    }

    #[test]
    fn test_stale_staging_ignores_unrelated_dotfiles() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), ".bob.cc.a1b2c3.tmp");
        touch(tmp.path(), ".editor-swap.tmp");
        touch(tmp.path(), ".cc.tmp");
        touch(tmp.path(), ".bob.cc..tmp");

        let dir = CredDir::new(tmp.path());
        assert_eq!(dir.remove_stale_staging().unwrap(), 1);
        assert!(!tmp.path().join(".bob.cc.a1b2c3.tmp").exists());
        assert!(tmp.path().join(".editor-swap.tmp").exists());
        assert!(tmp.path().join(".cc.tmp").exists());
        assert!(tmp.path().join(".bob.cc..tmp").exists());
    }

    #[test]
    fn test_ensure_rejects_file() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "plain");
        let dir = CredDir::new(tmp.path().join("plain"));
        assert!(dir.ensure().is_err());

        let nested = CredDir::new(tmp.path().join("a/b"));
        nested.ensure().unwrap();
        assert!(tmp.path().join("a/b").is_dir());
    }
}
