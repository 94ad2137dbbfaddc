//! Local capability-token signing.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BackendKind, CredentialProducer, ProduceError, Produced};
use crate::config::{SigningAlgorithm, TokenConfig, expand_str_path};
use crate::install::InstallPolicy;
use crate::layout::CredDir;
use crate::privilege::UserDb;
use crate::renewal::RenewalPolicy;

/// Token format version claim.
pub const TOKEN_VERSION: &str = "scitoken:2.0";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no signing key configured")]
    NoKeyConfigured,

    #[error("reading signing key {path}: {source}")]
    ReadKey {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing signing key {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        source: jsonwebtoken::errors::Error,
    },

    #[error("token lifetime {lifetime}s must be between 1 and {max}s")]
    InvalidLifetime { lifetime: u64, max: u64 },

    #[error("{0}")]
    Config(String),
}

/// Claims carried by a locally signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub scope: String,
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub ver: String,
}

/// Signs tokens with a key loaded once at start-up.
pub struct LocalTokenSigner {
    key: EncodingKey,
    algorithm: Algorithm,
    key_id: String,
    issuer: String,
    audience: Option<String>,
    lifetime: Duration,
    scope_template: String,
    users: Arc<dyn UserDb>,
}

impl std::fmt::Debug for LocalTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTokenSigner")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl LocalTokenSigner {
    pub fn from_config(config: &TokenConfig, users: Arc<dyn UserDb>) -> Result<Self, SignerError> {
        let raw = config
            .private_key
            .as_deref()
            .ok_or(SignerError::NoKeyConfigured)?;
        let path = expand_str_path(raw).map_err(|e| SignerError::Config(format!("{e:#}")))?;

        if config.lifetime_secs == 0 || config.lifetime_secs > config.max_lifetime_secs {
            return Err(SignerError::InvalidLifetime {
                lifetime: config.lifetime_secs,
                max: config.max_lifetime_secs,
            });
        }

        let pem = std::fs::read(&path).map_err(|source| SignerError::ReadKey {
            path: path.clone(),
            source,
        })?;
        Self::from_pem(&pem, config, users).map_err(|source| SignerError::InvalidKey { path, source })
    }

    /// Build a signer from PEM bytes with the rest taken from `config`.
    pub fn from_pem(
        pem: &[u8],
        config: &TokenConfig,
        users: Arc<dyn UserDb>,
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        let (key, algorithm) = match config.algorithm {
            SigningAlgorithm::ES256 => (EncodingKey::from_ec_pem(pem)?, Algorithm::ES256),
            SigningAlgorithm::RS256 => (EncodingKey::from_rsa_pem(pem)?, Algorithm::RS256),
        };
        Ok(Self {
            key,
            algorithm,
            key_id: config.key_id.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            lifetime: Duration::from_secs(config.lifetime_secs),
            scope_template: config.scope.clone(),
            users,
        })
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn claims_for(&self, username: &str) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            sub: username.to_string(),
            scope: self.scope_template.replace("{user}", username),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            nbf: now,
            exp: now + self.lifetime.as_secs() as i64,
            jti: uuid::Uuid::new_v4().to_string(),
            ver: TOKEN_VERSION.to_string(),
        }
    }

    /// Serialize and sign a token for `username`.
    pub fn sign(&self, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.key_id.clone());
        encode(&header, &self.claims_for(username), &self.key)
    }
}

#[async_trait]
impl CredentialProducer for LocalTokenSigner {
    fn kind(&self) -> BackendKind {
        BackendKind::Token
    }

    /// Renew at half the token lifetime.
    fn default_renewal(&self) -> RenewalPolicy {
        RenewalPolicy::new(self.lifetime / 2)
    }

    async fn produce(
        &self,
        username: &str,
        _input: &[u8],
        dir: &CredDir,
    ) -> Result<Produced, ProduceError> {
        let user = self
            .users
            .lookup(username)
            .ok_or_else(|| ProduceError::UnknownUser(username.to_string()))?;

        let token = self.sign(username).map_err(|source| ProduceError::Signing {
            username: username.to_string(),
            source,
        })?;

        let io_err = |source| ProduceError::Io {
            path: dir.root().to_path_buf(),
            source,
        };

        let mut staging = tempfile::Builder::new()
            .prefix(&format!(".{username}.cc."))
            .suffix(".tmp")
            .tempfile_in(dir.root())
            .map_err(io_err)?;
        staging.write_all(token.as_bytes()).map_err(io_err)?;
        staging.write_all(b"\n").map_err(io_err)?;
        staging.as_file().sync_all().map_err(io_err)?;
        let (_, path) = staging.keep().map_err(|e| io_err(e.error))?;

        debug!("signed token for {username} into {}", path.display());
        Ok(Produced {
            staging: path,
            policy: InstallPolicy::owned_by(user.uid, user.gid),
        })
    }
}
