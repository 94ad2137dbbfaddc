//! Follow-up programs run after a credential is produced or refreshed.
//!
//! Typical actions bootstrap dependent systems from the fresh credential,
//! e.g. obtaining an AFS token from a ticket cache. Each action gets an
//! environment built solely by its own builder; nothing is inherited from
//! the daemon unless the builder puts it there.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{HostRole, PostActionConfig};
use crate::privilege::Demotion;
use crate::validate::validate_env_key;

/// Values available to an action's environment builder and arguments.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub username: &'a str,
    pub uid: u32,
    pub gid: u32,
    pub home: &'a Path,
    /// Ticket cache or token file the action should use.
    pub credential: &'a Path,
}

impl ActionContext<'_> {
    /// Substitute `{user}`, `{uid}`, `{gid}`, `{home}` and `{credential}`.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{user}", self.username)
            .replace("{uid}", &self.uid.to_string())
            .replace("{gid}", &self.gid.to_string())
            .replace("{home}", &self.home.display().to_string())
            .replace("{credential}", &self.credential.display().to_string())
    }
}

/// Builds the complete environment of one action invocation.
pub type EnvBuilder = Arc<dyn Fn(&ActionContext<'_>) -> Vec<(String, String)> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("invalid post-action '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Clone)]
pub struct PostAction {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    demote: bool,
    timeout: Duration,
    env: EnvBuilder,
}

impl std::fmt::Debug for PostAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostAction")
            .field("name", &self.name)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("demote", &self.demote)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PostAction {
    /// A root-run action with an empty environment and a 30s timeout.
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            demote: false,
            timeout: Duration::from_secs(30),
            env: Arc::new(|_: &ActionContext<'_>| Vec::new()),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn demote(mut self, demote: bool) -> Self {
        self.demote = demote;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn environment<F>(mut self, builder: F) -> Self
    where
        F: Fn(&ActionContext<'_>) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.env = Arc::new(builder);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn demotes(&self) -> bool {
        self.demote
    }

    /// Build an action from configuration.
    ///
    /// `inherit_env` values are captured from the daemon's environment now,
    /// so the resulting builder stays a pure function of its context.
    pub fn from_config(config: &PostActionConfig) -> Result<Self, ActionError> {
        let invalid = |reason: String| ActionError::Invalid {
            name: config.name.clone(),
            reason,
        };

        if config.program.is_empty() {
            return Err(invalid("program is empty".into()));
        }
        for key in config
            .env
            .iter()
            .map(|e| e.name.as_str())
            .chain(config.inherit_env.iter().map(String::as_str))
        {
            validate_env_key(key).map_err(invalid)?;
        }

        let inherited: Vec<(String, String)> = config
            .inherit_env
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.clone(), v)))
            .collect();
        let templates: Vec<(String, String)> = config
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect();

        Ok(Self::new(&config.name, &config.program)
            .args(config.args.iter().cloned())
            .demote(config.demote)
            .timeout(Duration::from_secs(config.timeout_secs))
            .environment(move |ctx| {
                let mut env = inherited.clone();
                env.extend(templates.iter().map(|(k, v)| (k.clone(), ctx.render(v))));
                env
            }))
    }

    /// Run the action once and wait for it.
    pub async fn run(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| ctx.render(a)))
            .env_clear()
            .envs((self.env)(ctx))
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.demote {
            Demotion::new(ctx.uid, ctx.gid).apply(&mut cmd);
        }

        let child = cmd.spawn().map_err(|source| ActionError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ActionError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ActionError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{}: {}: {}", ctx.username, self.name, stdout.trim());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ActionError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            info!("{}: {}: {}", ctx.username, self.name, stderr.trim());
        }
        Ok(())
    }
}

/// Result of running the action list for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub ran: usize,
    pub failed: usize,
}

/// Ordered list of post-actions fixed at start-up.
#[derive(Debug, Clone, Default)]
pub struct PostActionRunner {
    actions: Vec<PostAction>,
}

impl PostActionRunner {
    pub fn new(actions: Vec<PostAction>) -> Self {
        Self { actions }
    }

    /// Build the list for a host role, keeping configuration order.
    pub fn for_role(configs: &[PostActionConfig], role: HostRole) -> Result<Self, ActionError> {
        let actions = configs
            .iter()
            .filter(|c| c.hosts.matches(role))
            .map(PostAction::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { actions })
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Run every action in order. A failing action is logged and the
    /// remaining ones still run.
    pub async fn run_all(&self, ctx: &ActionContext<'_>) -> ActionSummary {
        let mut summary = ActionSummary::default();
        for action in &self.actions {
            summary.ran += 1;
            match action.run(ctx).await {
                Ok(()) => debug!("{}: post-action '{}' done", ctx.username, action.name),
                Err(e) => {
                    summary.failed += 1;
                    if action.demote {
                        warn!(
                            "{}: post-action '{}' (as {}:{}) failed: {e}",
                            ctx.username, action.name, ctx.uid, ctx.gid
                        );
                    } else {
                        error!("{}: post-action '{}' failed: {e}", ctx.username, action.name);
                    }
                }
            }
        }
        summary
    }
}
