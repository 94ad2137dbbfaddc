//! External ticket-granting authority.
//!
//! The authority reads the opaque credential on stdin and writes a ticket
//! cache to the location named by `KRB5CCNAME` (or the configured variable).
//! Its environment is built per invocation; the daemon's own environment is
//! never modified.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{BackendKind, CredentialProducer, ProduceError, Produced};
use crate::config::TicketConfig;
use crate::install::InstallPolicy;
use crate::layout::{CredDir, remove_if_exists};
use crate::renewal::RenewalPolicy;

#[derive(Debug, Clone)]
pub struct TicketAuthority {
    program: PathBuf,
    args: Vec<String>,
    cache_env: String,
    cache_prefix: String,
    path_env: String,
    timeout: Duration,
    owner: (u32, u32),
}

impl TicketAuthority {
    pub fn from_config(config: &TicketConfig) -> Self {
        Self {
            program: PathBuf::from(&config.program),
            args: config.args.clone(),
            cache_env: config.cache_env.clone(),
            cache_prefix: config.cache_prefix.clone(),
            path_env: config.path_env.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            owner: (config.owner_uid, config.owner_gid),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether the authority binary exists and has an execute bit.
    pub fn is_available(&self) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(&self.program)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn command(&self, username: &str, staging: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("USER", username)
            .env(
                &self.cache_env,
                format!("{}{}", self.cache_prefix, staging.display()),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CredentialProducer for TicketAuthority {
    fn kind(&self) -> BackendKind {
        BackendKind::Ticket
    }

    fn default_renewal(&self) -> RenewalPolicy {
        RenewalPolicy::default()
    }

    async fn produce(
        &self,
        username: &str,
        input: &[u8],
        dir: &CredDir,
    ) -> Result<Produced, ProduceError> {
        let staging = dir.staging_path(username);
        remove_if_exists(&staging).map_err(|source| ProduceError::Io {
            path: staging.clone(),
            source,
        })?;

        let mut child = self
            .command(username, &staging)
            .spawn()
            .map_err(|source| ProduceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let run = async { tokio::join!(feed, child.wait_with_output()) };
        let (fed, output) = match timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                let _ = remove_if_exists(&staging);
                return Err(ProduceError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if let Err(e) = fed {
            debug!("{username}: authority did not consume its input: {e}");
        }
        let output = output.map_err(|source| ProduceError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            info!("{username}: {}: {}", self.program.display(), stdout.trim());
        }
        if !stderr.trim().is_empty() {
            warn!("{username}: {}: {}", self.program.display(), stderr.trim());
        }

        if !output.status.success() {
            let _ = remove_if_exists(&staging);
            return Err(ProduceError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let produced = std::fs::metadata(&staging)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !produced {
            let _ = remove_if_exists(&staging);
            return Err(ProduceError::MissingOutput { path: staging });
        }

        Ok(Produced {
            staging,
            policy: InstallPolicy {
                uid: self.owner.0,
                gid: self.owner.1,
                mode: 0o400,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a shell script acting as the authority.
    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("authority.sh");
        std::fs::write(&path, format!("{body}\n")).unwrap();
        path
    }

    /// Run the script through `/bin/sh` so it never needs an exec bit.
    fn authority(script: &Path, timeout_secs: u64) -> TicketAuthority {
        TicketAuthority::from_config(&TicketConfig {
            program: "/bin/sh".to_string(),
            args: vec![script.display().to_string()],
            timeout_secs,
            ..TicketConfig::default()
        })
    }

    #[tokio::test]
    async fn test_authority_receives_input_and_environment() {
        let bin = TempDir::new().unwrap();
        let creds = TempDir::new().unwrap();
        let program = script(
            bin.path(),
            r#"path="${KRB5CCNAME#FILE:}"
{ echo "user=$USER"; cat; } > "$path""#,
        );
        let dir = CredDir::new(creds.path());

        let produced = authority(&program, 10)
            .produce("alice", b"opaque-blob", &dir)
            .await
            .unwrap();

        assert_eq!(produced.staging, dir.staging_path("alice"));
        assert_eq!(produced.policy.mode, 0o400);
        let written = std::fs::read_to_string(&produced.staging).unwrap();
        assert_eq!(written, "user=alice\nopaque-blob");
    }

    #[tokio::test]
    async fn test_parent_environment_not_leaked() {
        let bin = TempDir::new().unwrap();
        let creds = TempDir::new().unwrap();
        let program = script(
            bin.path(),
            r#"env | sort > "${KRB5CCNAME#FILE:}""#,
        );
        let dir = CredDir::new(creds.path());

        let produced = authority(&program, 10)
            .produce("alice", b"", &dir)
            .await
            .unwrap();
        let env = std::fs::read_to_string(&produced.staging).unwrap();
        assert!(env.contains("USER=alice"));
        assert!(env.lines().all(|l| !l.starts_with("HOME=")));
        // parent's USER is untouched
        assert_ne!(std::env::var("USER").ok().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let bin = TempDir::new().unwrap();
        let creds = TempDir::new().unwrap();
        let program = script(
            bin.path(),
            r#"echo partial > "${KRB5CCNAME#FILE:}"; echo "kdc unreachable" >&2; exit 3"#,
        );
        let dir = CredDir::new(creds.path());

        let err = authority(&program, 10)
            .produce("alice", b"", &dir)
            .await
            .unwrap_err();
        match err {
            ProduceError::Failed { stderr, .. } => assert_eq!(stderr, "kdc unreachable"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.staging_path("alice").exists());
    }

    #[tokio::test]
    async fn test_success_without_output_is_failure() {
        let bin = TempDir::new().unwrap();
        let creds = TempDir::new().unwrap();
        let program = script(bin.path(), "exit 0");
        let dir = CredDir::new(creds.path());

        let err = authority(&program, 10)
            .produce("alice", b"", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let creds = TempDir::new().unwrap();
        let dir = CredDir::new(creds.path());
        let missing = TicketAuthority::from_config(&TicketConfig {
            program: "/nonexistent/gettgt".to_string(),
            ..TicketConfig::default()
        });
        assert!(!missing.is_available());

        let err = missing.produce("alice", b"", &dir).await.unwrap_err();
        assert!(matches!(err, ProduceError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_hung_authority_times_out() {
        let bin = TempDir::new().unwrap();
        let creds = TempDir::new().unwrap();
        let program = script(bin.path(), "exec sleep 30");
        let dir = CredDir::new(creds.path());

        let started = std::time::Instant::now();
        let err = authority(&program, 1)
            .produce("alice", b"", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stale_staging_removed_before_run() {
        let bin = TempDir::new().unwrap();
        let creds = TempDir::new().unwrap();
        let dir = CredDir::new(creds.path());
        std::fs::write(dir.staging_path("alice"), b"stale").unwrap();
        let program = script(bin.path(), "exit 0");

        let err = authority(&program, 10)
            .produce("alice", b"", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::MissingOutput { .. }));
        assert!(!dir.staging_path("alice").exists());
    }
}
