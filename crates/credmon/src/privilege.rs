//! Identity handling: passwd lookups, per-subprocess demotion and the
//! scoped elevation guard used around reaping.
//!
//! The daemon's own real identity is never changed. Demotion happens only
//! inside a forked child between `fork` and `exec`; elevation only touches
//! the effective ids and is undone when the guard drops.

use std::ffi::{CStr, CString};
use std::io;
use std::path::PathBuf;

use log::{debug, error};
use rustix::process::{getegid, geteuid, getgid, getuid};
use thiserror::Error;

/// A resolved passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Source of passwd entries.
pub trait UserDb: Send + Sync {
    fn lookup(&self, name: &str) -> Option<UserEntry>;
}

/// Passwd database of the host (NSS).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserDb for SystemUsers {
    fn lookup(&self, name: &str) -> Option<UserEntry> {
        lookup_user(name)
    }
}

/// Look up a user by name with `getpwnam_r`.
pub fn lookup_user(name: &str) -> Option<UserEntry> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: all pointers come from read_passwd and outlive the call.
    read_passwd(|pwd, buf, len, result| unsafe {
        libc::getpwnam_r(c_name.as_ptr(), pwd, buf, len, result)
    })
}

/// Passwd entry of the real uid of this process.
pub fn current_user() -> Option<UserEntry> {
    let uid = getuid().as_raw();
    // SAFETY: all pointers come from read_passwd and outlive the call.
    read_passwd(|pwd, buf, len, result| unsafe { libc::getpwuid_r(uid, pwd, buf, len, result) })
}

fn read_passwd<F>(query: F) -> Option<UserEntry>
where
    F: Fn(*mut libc::passwd, *mut libc::c_char, libc::size_t, *mut *mut libc::passwd) -> libc::c_int,
{
    const MAX_BUF: usize = 1 << 20;
    let mut buf: Vec<libc::c_char> = vec![0; 4096];
    loop {
        // SAFETY: passwd is plain old data; zeroed is a valid initial state.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = query(
            &mut pwd as *mut libc::passwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result as *mut *mut libc::passwd,
        );
        if rc == libc::ERANGE && buf.len() < MAX_BUF {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: on success pw_name and pw_dir are valid C strings inside buf.
        let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_str().ok()?;
        let home = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_str().ok()?;
        return Some(UserEntry {
            name: name.to_string(),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home: PathBuf::from(home),
        });
    }
}

// ============================================================================
// Demotion
// ============================================================================

/// Drops a child process to `(uid, gid)` right before it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demotion {
    uid: u32,
    gid: u32,
}

impl Demotion {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Install the identity switch as a `pre_exec` hook on `cmd`.
    pub fn apply(self, cmd: &mut tokio::process::Command) {
        let Demotion { uid, gid } = self;
        // SAFETY: the hook runs in the forked child and only calls
        // async-signal-safe libc functions; it allocates nothing.
        unsafe {
            cmd.pre_exec(move || drop_to(uid, gid));
        }
    }
}

/// Group first: once the uid is dropped the gid can no longer change.
fn drop_to(uid: libc::uid_t, gid: libc::gid_t) -> io::Result<()> {
    // SAFETY: plain syscalls on values owned by this stack frame.
    unsafe {
        if libc::geteuid() == 0 && libc::setgroups(1, &gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setgid(gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(uid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if uid != 0 && libc::setuid(0) == 0 {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
    }
    Ok(())
}

// ============================================================================
// Elevation guard
// ============================================================================

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("cannot raise effective uid from {euid} to root: {source}")]
    Elevate { euid: u32, source: io::Error },
}

/// Raises the effective ids to root and restores them on drop.
#[derive(Debug)]
#[must_use = "privileges are restored as soon as the guard is dropped"]
pub struct PrivilegeGuard {
    saved_euid: u32,
    saved_egid: u32,
    changed: bool,
}

impl PrivilegeGuard {
    /// Switch effective uid/gid to root. A no-op when already root.
    pub fn elevate() -> Result<Self, PrivilegeError> {
        let saved_euid = geteuid().as_raw();
        let saved_egid = getegid().as_raw();
        if saved_euid == 0 {
            return Ok(Self {
                saved_euid,
                saved_egid,
                changed: false,
            });
        }

        // SAFETY: plain syscalls; failures are reported through errno.
        if unsafe { libc::seteuid(0) } != 0 {
            return Err(PrivilegeError::Elevate {
                euid: saved_euid,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: as above; euid is root so setegid is permitted.
        if unsafe { libc::setegid(0) } != 0 {
            let source = io::Error::last_os_error();
            // SAFETY: returning to the id we just left.
            unsafe { libc::seteuid(saved_euid) };
            return Err(PrivilegeError::Elevate {
                euid: saved_euid,
                source,
            });
        }
        debug!("raised effective identity from {saved_euid}:{saved_egid} to root");
        Ok(Self {
            saved_euid,
            saved_egid,
            changed: true,
        })
    }

    /// A guard that leaves the current identity alone.
    pub fn inherit() -> Self {
        Self {
            saved_euid: geteuid().as_raw(),
            saved_egid: getegid().as_raw(),
            changed: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if !self.changed {
            return;
        }
        // SAFETY: euid is still root, so both calls are permitted.
        unsafe {
            if libc::setegid(self.saved_egid) != 0 {
                error!(
                    "failed to restore effective gid {}: {}",
                    self.saved_egid,
                    io::Error::last_os_error()
                );
            }
            if libc::seteuid(self.saved_euid) != 0 {
                error!(
                    "failed to restore effective uid {}: {}",
                    self.saved_euid,
                    io::Error::last_os_error()
                );
            }
        }
        debug!(
            "restored effective identity {}:{}",
            self.saved_euid, self.saved_egid
        );
    }
}

/// Real (uid, gid) of this process.
pub fn real_ids() -> (u32, u32) {
    (getuid().as_raw(), getgid().as_raw())
}
