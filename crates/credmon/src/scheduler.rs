//! Query for the set of users that currently own scheduled jobs.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::SchedulerConfig;

#[derive(Debug, Error)]
pub enum OwnerQueryError {
    /// No scheduler on this host; reaping does not apply.
    #[error("no local scheduler available")]
    Unavailable,

    #[error("scheduler query {program} timed out after {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },

    #[error("scheduler query {program} failed: {reason}")]
    Failed { program: PathBuf, reason: String },
}

/// Source of the distinct owners of live jobs.
#[async_trait]
pub trait JobOwnerSource: Send + Sync {
    async fn active_owners(&self) -> Result<HashSet<String>, OwnerQueryError>;
}

/// Host without a scheduler endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScheduler;

#[async_trait]
impl JobOwnerSource for NoScheduler {
    async fn active_owners(&self) -> Result<HashSet<String>, OwnerQueryError> {
        Err(OwnerQueryError::Unavailable)
    }
}

/// Runs a configured command printing one owner per line.
#[derive(Debug, Clone)]
pub struct CommandOwnerSource {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOwnerSource {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

/// The owner source for `config`: a command if one is set, else none.
pub fn owner_source(config: &SchedulerConfig) -> Box<dyn JobOwnerSource> {
    match config.command.as_deref() {
        Some(command) if !command.trim().is_empty() => Box::new(CommandOwnerSource::new(
            command,
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )),
        _ => Box::new(NoScheduler),
    }
}

#[async_trait]
impl JobOwnerSource for CommandOwnerSource {
    async fn active_owners(&self) -> Result<HashSet<String>, OwnerQueryError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("scheduler query {} not installed", self.program.display());
                return Err(OwnerQueryError::Unavailable);
            }
            Err(e) => {
                return Err(OwnerQueryError::Failed {
                    program: self.program.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OwnerQueryError::Timeout {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| OwnerQueryError::Failed {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(OwnerQueryError::Failed {
                program: self.program.clone(),
                reason: format!(
                    "exit {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(parse_owners(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// One owner per line; blank lines ignored, duplicates collapsed.
pub fn parse_owners(text: &str) -> HashSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_owners_dedupes_and_trims() {
        let owners = parse_owners("alice\n bob \n\nalice\n");
        assert_eq!(owners.len(), 2);
        assert!(owners.contains("alice"));
        assert!(owners.contains("bob"));
    }

    #[tokio::test]
    async fn test_no_scheduler_is_unavailable() {
        assert!(matches!(
            NoScheduler.active_owners().await,
            Err(OwnerQueryError::Unavailable)
        ));
        let source = owner_source(&SchedulerConfig::default());
        assert!(matches!(
            source.active_owners().await,
            Err(OwnerQueryError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_command_output_is_owner_set() {
        let source = CommandOwnerSource::new(
            "/bin/sh",
            vec!["-c".into(), "printf 'bob\\ncarol\\nbob\\n'".into()],
            Duration::from_secs(10),
        );
        let owners = source.active_owners().await.unwrap();
        assert_eq!(owners, HashSet::from(["bob".to_string(), "carol".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_query_binary_is_unavailable() {
        let source = CommandOwnerSource::new("/nonexistent/condor_q", vec![], Duration::from_secs(1));
        assert!(matches!(
            source.active_owners().await,
            Err(OwnerQueryError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_failing_query_is_error_not_empty_set() {
        let source = CommandOwnerSource::new(
            "/bin/sh",
            vec!["-c".into(), "echo boom >&2; exit 2".into()],
            Duration::from_secs(10),
        );
        assert!(matches!(
            source.active_owners().await,
            Err(OwnerQueryError::Failed { .. })
        ));
    }
}
