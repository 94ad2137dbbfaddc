//! Credential producers.
//!
//! A producer turns one request into a staging file that the installer can
//! promote. Two backends exist:
//!
//! - [`TicketAuthority`]: runs an external ticket-granting program that
//!   writes a Kerberos ticket cache into the staging path.
//! - [`LocalTokenSigner`]: signs a capability token in-process.
//!
//! Exactly one backend is selected at start-up by [`select_backend`].

mod ticket;
mod token;

pub use ticket::TicketAuthority;
pub use token::{LocalTokenSigner, SignerError, TokenClaims};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;

use crate::config::{BackendPreference, CredmonConfig};
use crate::install::InstallPolicy;
use crate::layout::CredDir;
use crate::privilege::UserDb;
use crate::renewal::RenewalPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ticket,
    Token,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Ticket => f.write_str("ticket-authority"),
            BackendKind::Token => f.write_str("local-token-signer"),
        }
    }
}

/// A staging file ready for installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced {
    pub staging: PathBuf,
    pub policy: InstallPolicy,
}

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: PathBuf, source: io::Error },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("authority reported success but {path} is missing or empty")]
    MissingOutput { path: PathBuf },

    #[error("user {0} not found in passwd database")]
    UnknownUser(String),

    #[error("signing token for {username}: {source}")]
    Signing {
        username: String,
        source: jsonwebtoken::errors::Error,
    },

    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Turns a credential request into a staging file.
#[async_trait]
pub trait CredentialProducer: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Renewal policy used when the configuration does not override it.
    fn default_renewal(&self) -> RenewalPolicy;

    /// Produce a derived credential for `username` from the opaque `input`.
    async fn produce(
        &self,
        username: &str,
        input: &[u8],
        dir: &CredDir,
    ) -> Result<Produced, ProduceError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("local token signing unavailable: {0}")]
    Signer(#[from] SignerError),

    #[error("ticket authority {0} is missing or not executable")]
    AuthorityUnavailable(PathBuf),
}

/// Pick the one producer this process will use.
///
/// With `backend = "auto"` a configured signing key selects local signing;
/// otherwise the ticket authority is used. In non-strict mode an unusable
/// key falls back to the ticket authority and a missing authority binary
/// only produces a warning (each request will then fail per user).
pub fn select_backend(
    config: &CredmonConfig,
    users: Arc<dyn UserDb>,
) -> Result<Box<dyn CredentialProducer>, BackendError> {
    let strict = config.startup.strict;

    let try_token = match config.backend {
        BackendPreference::Token => true,
        BackendPreference::Auto => config.token.private_key.is_some(),
        BackendPreference::Ticket => false,
    };

    if try_token {
        match LocalTokenSigner::from_config(&config.token, users) {
            Ok(signer) => {
                info!(
                    "using local token signer (kid={}, lifetime={}s)",
                    config.token.key_id, config.token.lifetime_secs
                );
                return Ok(Box::new(signer));
            }
            Err(e) if strict || config.backend == BackendPreference::Token => {
                return Err(e.into());
            }
            Err(e) => warn!("local token signing disabled: {e}; falling back to ticket authority"),
        }
    }

    let authority = TicketAuthority::from_config(&config.ticket);
    if !authority.is_available() {
        if strict {
            return Err(BackendError::AuthorityUnavailable(
                authority.program().to_path_buf(),
            ));
        }
        warn!(
            "ticket authority {} is missing or not executable; requests will fail until it appears",
            authority.program().display()
        );
    }
    info!("using ticket authority {}", authority.program().display());
    Ok(Box::new(authority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::SystemUsers;
    use tempfile::TempDir;

    fn users() -> Arc<dyn UserDb> {
        Arc::new(SystemUsers)
    }

    #[test]
    fn test_auto_without_key_uses_ticket_authority() {
        let mut config = CredmonConfig::default();
        config.ticket.program = "/bin/true".into();
        let producer = select_backend(&config, users()).unwrap();
        assert_eq!(producer.kind(), BackendKind::Ticket);
    }

    #[test]
    fn test_strict_rejects_missing_authority() {
        let mut config = CredmonConfig::default();
        config.ticket.program = "/nonexistent/gettgt".into();
        let err = select_backend(&config, users()).err().unwrap();
        assert!(matches!(err, BackendError::AuthorityUnavailable(_)));

        config.startup.strict = false;
        let producer = select_backend(&config, users()).unwrap();
        assert_eq!(producer.kind(), BackendKind::Ticket);
    }

    #[test]
    fn test_unreadable_key_strict_vs_degraded() {
        let tmp = TempDir::new().unwrap();
        let mut config = CredmonConfig::default();
        config.ticket.program = "/bin/true".into();
        config.token.private_key = Some(tmp.path().join("missing.pem").display().to_string());

        assert!(matches!(
            select_backend(&config, users()).err().unwrap(),
            BackendError::Signer(_)
        ));

        config.startup.strict = false;
        let producer = select_backend(&config, users()).unwrap();
        assert_eq!(producer.kind(), BackendKind::Ticket);
    }

    #[test]
    fn test_explicit_token_backend_never_degrades() {
        let mut config = CredmonConfig::default();
        config.backend = BackendPreference::Token;
        config.startup.strict = false;
        config.ticket.program = "/bin/true".into();
        assert!(select_backend(&config, users()).is_err());
    }
}
