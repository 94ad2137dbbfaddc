//! Daemon configuration.
//!
//! Layering: built-in defaults, then the TOML file (optional), then
//! `CREDMON__SECTION__KEY` environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Default location of the system configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/credmon/credmon.toml";

/// Credential directory used when nothing is configured.
pub const DEFAULT_CRED_DIR: &str = "/var/lib/credmon/credentials";

const ENV_PREFIX: &str = "CREDMON";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredmonConfig {
    /// Directory holding `.cred`, `.cc`, markers, pid and completion flag.
    pub cred_dir: String,
    /// Seconds to sleep between scan cycles.
    pub poll_interval_secs: u64,
    /// Which credential backend to use.
    pub backend: BackendPreference,
    /// Whether this host runs a scheduler endpoint.
    pub role: HostRole,
    pub startup: StartupConfig,
    pub renewal: RenewalConfig,
    pub ticket: TicketConfig,
    pub token: TokenConfig,
    pub scheduler: SchedulerConfig,
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
    pub post_actions: Vec<PostActionConfig>,
}

impl Default for CredmonConfig {
    fn default() -> Self {
        Self {
            cred_dir: DEFAULT_CRED_DIR.to_string(),
            poll_interval_secs: 60,
            backend: BackendPreference::Auto,
            role: HostRole::Auto,
            startup: StartupConfig::default(),
            renewal: RenewalConfig::default(),
            ticket: TicketConfig::default(),
            token: TokenConfig::default(),
            scheduler: SchedulerConfig::default(),
            reaper: ReaperConfig::default(),
            logging: LoggingConfig::default(),
            post_actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// Local signing when a key is configured, ticket authority otherwise.
    Auto,
    Ticket,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostRole {
    /// Scheduler when a scheduler query is configured, worker otherwise.
    Auto,
    Scheduler,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Refuse to start on an unusable signing key or credential directory.
    /// When false those problems only degrade functionality.
    pub strict: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    /// Age at which a derived credential is regenerated. Unset means the
    /// backend default (5h for tickets, half the token lifetime for tokens).
    pub threshold_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    /// Ticket-granting authority program.
    pub program: String,
    /// Fixed argument vector.
    pub args: Vec<String>,
    /// Variable naming the ticket cache location.
    pub cache_env: String,
    /// Prefix put in front of the staging path in `cache_env`.
    pub cache_prefix: String,
    /// `PATH` handed to the authority.
    pub path_env: String,
    pub timeout_secs: u64,
    /// Owner of installed ticket caches.
    pub owner_uid: u32,
    pub owner_gid: u32,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            program: "/usr/libexec/credmon/gettgt".to_string(),
            args: Vec::new(),
            cache_env: "KRB5CCNAME".to_string(),
            cache_prefix: "FILE:".to_string(),
            path_env: "/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
            timeout_secs: 60,
            owner_uid: 0,
            owner_gid: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    ES256,
    RS256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// PEM private key (PKCS#8 for ES256, PKCS#1/PKCS#8 for RS256).
    pub private_key: Option<String>,
    /// Key identifier put in the token header.
    pub key_id: String,
    pub algorithm: SigningAlgorithm,
    pub issuer: String,
    pub audience: Option<String>,
    pub lifetime_secs: u64,
    /// Upper bound `lifetime_secs` is checked against at start-up.
    pub max_lifetime_secs: u64,
    /// Scope claim template; `{user}` is replaced with the username.
    pub scope: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            key_id: "local".to_string(),
            algorithm: SigningAlgorithm::ES256,
            issuer: "https://localhost".to_string(),
            audience: None,
            lifetime_secs: 1200,
            max_lifetime_secs: 1200,
            scope: "read:/user/{user} write:/user/{user}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Program printing the current job owners, one per line.
    /// Unset means no local scheduler.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    /// Raise the effective uid to root while reaping.
    pub elevate: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            elevate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file. Unset means `<cred_dir>/credmon.log`.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}

/// Which hosts a post-action runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionHosts {
    Any,
    Scheduler,
    Worker,
}

impl ActionHosts {
    pub fn matches(self, role: HostRole) -> bool {
        match self {
            ActionHosts::Any => true,
            ActionHosts::Scheduler => role == HostRole::Scheduler,
            ActionHosts::Worker => role == HostRole::Worker,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostActionConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Run as the credential's owner instead of root.
    #[serde(default)]
    pub demote: bool,
    #[serde(default = "default_action_hosts")]
    pub hosts: ActionHosts,
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,
    /// Environment templates; `{user}`, `{uid}`, `{gid}`, `{home}` and
    /// `{credential}` are substituted per invocation.
    #[serde(default)]
    pub env: Vec<EnvEntry>,
    /// Variables copied from the daemon's environment at start-up.
    #[serde(default)]
    pub inherit_env: Vec<String>,
}

fn default_action_hosts() -> ActionHosts {
    ActionHosts::Any
}

fn default_action_timeout() -> u64 {
    30
}

/// A loaded configuration and the file it came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: CredmonConfig,
    pub source: Option<PathBuf>,
}

/// Load configuration from `path` (or the default location) plus the
/// environment. A missing file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let source = path.exists().then(|| path.to_path_buf());

    let built = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let config: CredmonConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing configuration from {}", path.display()))?;

    Ok(LoadedConfig { config, source })
}

/// Expand `~` and `$VAR` in a configured path.
pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(text).with_context(|| format!("expanding path {text}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl CredmonConfig {
    pub fn cred_dir_path(&self) -> Result<PathBuf> {
        expand_str_path(&self.cred_dir)
    }

    /// The configured role with `Auto` resolved.
    pub fn effective_role(&self) -> HostRole {
        match self.role {
            HostRole::Auto if self.scheduler.command.is_some() => HostRole::Scheduler,
            HostRole::Auto => HostRole::Worker,
            other => other,
        }
    }

    /// Render as TOML with a short header.
    pub fn to_toml(&self) -> Result<String> {
        let body = toml::to_string_pretty(self).context("serializing config to TOML")?;
        Ok(format!("# Configuration for credmon\n\n{body}"))
    }
}
