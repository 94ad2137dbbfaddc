//! Renewal decision for derived credentials.

use std::path::Path;
use std::time::{Duration, SystemTime};

use log::debug;

use crate::layout::CredDir;

/// Default threshold for Kerberos ticket caches.
pub const TICKET_RENEWAL_THRESHOLD: Duration = Duration::from_secs(5 * 60 * 60);

/// Decides whether a derived credential must be regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    threshold: Duration,
}

impl RenewalPolicy {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// True when `<username>.cc` is missing or at least `threshold` old.
    pub fn should_renew(&self, dir: &CredDir, username: &str) -> bool {
        self.should_renew_at(&dir.derived_path(username), SystemTime::now())
    }

    /// Same as [`should_renew`](Self::should_renew) with an explicit clock.
    ///
    /// Any failure to establish the credential's age counts as stale,
    /// including a modification time in the future.
    pub fn should_renew_at(&self, derived: &Path, now: SystemTime) -> bool {
        let modified = match std::fs::metadata(derived).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                debug!("{}: no usable timestamp ({e}), renewing", derived.display());
                return true;
            }
        };
        match now.duration_since(modified) {
            Ok(age) => age >= self.threshold,
            Err(_) => {
                debug!("{}: timestamp is in the future, renewing", derived.display());
                true
            }
        }
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::new(TICKET_RENEWAL_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn derived_with_mtime(dir: &Path, mtime: SystemTime) -> std::path::PathBuf {
        let path = dir.join("alice.cc");
        let file = File::create(&path).unwrap();
        file.set_modified(mtime).unwrap();
        path
    }

    #[test]
    fn test_missing_credential_needs_renewal() {
        let tmp = TempDir::new().unwrap();
        let dir = CredDir::new(tmp.path());
        let policy = RenewalPolicy::default();
        assert!(policy.should_renew(&dir, "alice"));
    }

    #[test]
    fn test_exactly_at_threshold_renews() {
        let tmp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let policy = RenewalPolicy::default();
        let path = derived_with_mtime(tmp.path(), now - policy.threshold());
        assert!(policy.should_renew_at(&path, now));
    }

    #[test]
    fn test_one_millisecond_under_threshold_keeps() {
        let tmp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let policy = RenewalPolicy::default();
        let mtime = now - policy.threshold() + Duration::from_millis(1);
        let path = derived_with_mtime(tmp.path(), mtime);
        assert!(!policy.should_renew_at(&path, now));
    }

    #[test]
    fn test_fresh_credential_kept() {
        let tmp = TempDir::new().unwrap();
        let dir = CredDir::new(tmp.path());
        std::fs::write(dir.derived_path("alice"), b"ticket").unwrap();
        assert!(!RenewalPolicy::default().should_renew(&dir, "alice"));
    }

    #[test]
    fn test_future_timestamp_renews() {
        let tmp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let path = derived_with_mtime(tmp.path(), now + Duration::from_secs(3600));
        assert!(RenewalPolicy::default().should_renew_at(&path, now));
    }

    #[test]
    fn test_custom_threshold() {
        let tmp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let policy = RenewalPolicy::new(Duration::from_secs(600));
        let path = derived_with_mtime(tmp.path(), now - Duration::from_secs(601));
        assert!(policy.should_renew_at(&path, now));
        let path = derived_with_mtime(tmp.path(), now - Duration::from_secs(599));
        assert!(!policy.should_renew_at(&path, now));
    }
}
