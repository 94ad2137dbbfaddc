//! The scan cycle: list requests, renew or refresh each user, reap, and
//! raise the completion flag.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use crate::install::{install, prepare};
use crate::layout::{CredDir, CredentialRequest};
use crate::post_action::{ActionContext, PostActionRunner};
use crate::privilege::UserDb;
use crate::producer::CredentialProducer;
use crate::reaper::{ReapError, Reaper};
use crate::renewal::RenewalPolicy;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("listing {path}: {source}")]
    Listing {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("updating completion flag {path}: {source}")]
    Flag {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cycle interrupted by termination request")]
    Interrupted,
}

/// Counters for one finished cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub listed: usize,
    pub renewed: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reaped: usize,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listed={} renewed={} refreshed={} failed={} skipped={} reaped={}",
            self.listed, self.renewed, self.refreshed, self.failed, self.skipped, self.reaped
        )
    }
}

/// What happened to one user during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    /// A new credential was produced and installed.
    Renewed,
    /// The credential is fresh; post-actions were re-run.
    Refreshed,
    /// Nothing to do (request vanished, or no identity for a refresh).
    Skipped,
    Failed,
}

pub struct Monitor {
    dir: CredDir,
    producer: Box<dyn CredentialProducer>,
    renewal: RenewalPolicy,
    actions: PostActionRunner,
    reaper: Option<Reaper>,
    users: Arc<dyn UserDb>,
    shutdown: watch::Receiver<bool>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("dir", &self.dir)
            .field("backend", &self.producer.kind())
            .field("renewal", &self.renewal)
            .field("actions", &self.actions.len())
            .field("reaper", &self.reaper)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// A monitor with the producer's default renewal policy, no post-actions
    /// and no reaper.
    pub fn new(
        dir: CredDir,
        producer: Box<dyn CredentialProducer>,
        users: Arc<dyn UserDb>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let renewal = producer.default_renewal();
        Self {
            dir,
            producer,
            renewal,
            actions: PostActionRunner::default(),
            reaper: None,
            users,
            shutdown,
        }
    }

    pub fn with_renewal(mut self, renewal: RenewalPolicy) -> Self {
        self.renewal = renewal;
        self
    }

    pub fn with_actions(mut self, actions: PostActionRunner) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_reaper(mut self, reaper: Reaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn dir(&self) -> &CredDir {
        &self.dir
    }

    pub fn renewal(&self) -> RenewalPolicy {
        self.renewal
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Poll until shutdown is signalled. A message on `reload` cuts the
    /// sleep short; it never interrupts a cycle in progress.
    pub async fn run(&self, interval: Duration, mut reload: watch::Receiver<()>) {
        info!(
            "monitoring {} every {interval:?} with {}",
            self.dir.root().display(),
            self.producer.kind()
        );
        loop {
            match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(Ok(report)) => info!("cycle complete: {report}"),
                Ok(Err(CycleError::Interrupted)) => {
                    info!("termination requested; stopping mid-cycle");
                    return;
                }
                Ok(Err(e)) => error!("cycle failed: {e}; retrying in {interval:?}"),
                Err(panic) => error!(
                    "cycle panicked: {}; retrying in {interval:?}",
                    panic_message(&*panic)
                ),
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("termination requested; stopping");
                    return;
                }
                Ok(()) = reload.changed() => info!("reload requested; starting cycle early"),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One full pass over the credential directory.
    ///
    /// The completion flag is removed first and written last. A cycle cut
    /// short by termination or a listing error leaves it absent.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let flag_err = |source| CycleError::Flag {
            path: self.dir.completion_flag(),
            source,
        };
        self.dir.clear_completion_flag().map_err(flag_err)?;

        let requests = self.dir.list_requests().map_err(|source| CycleError::Listing {
            path: self.dir.root().to_path_buf(),
            source,
        })?;
        let mut report = CycleReport {
            listed: requests.len(),
            ..CycleReport::default()
        };

        for request in &requests {
            if self.stopping() {
                return Err(CycleError::Interrupted);
            }
            match self.process_user_guarded(request).await {
                UserOutcome::Renewed => report.renewed += 1,
                UserOutcome::Refreshed => report.refreshed += 1,
                UserOutcome::Skipped => report.skipped += 1,
                UserOutcome::Failed => report.failed += 1,
            }
        }

        if self.stopping() {
            return Err(CycleError::Interrupted);
        }

        if let Some(reaper) = &self.reaper {
            match reaper.reap().await {
                Ok(reaped) => {
                    report.reaped = reaped.reaped.len();
                    if reaped.failures > 0 {
                        warn!("reaping finished with {} removal failure(s)", reaped.failures);
                    }
                }
                Err(ReapError::Unavailable) => debug!("no local scheduler; reaping skipped"),
                Err(e) => warn!("reaping skipped: {e}"),
            }
        }

        self.dir.mark_complete().map_err(flag_err)?;
        Ok(report)
    }

    /// Process one user, turning a panic into a failure for that user only.
    async fn process_user_guarded(&self, request: &CredentialRequest) -> UserOutcome {
        match AssertUnwindSafe(self.process_user(request))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    "{}: processing panicked: {}",
                    request.username,
                    panic_message(&*panic)
                );
                UserOutcome::Failed
            }
        }
    }

    pub async fn process_user(&self, request: &CredentialRequest) -> UserOutcome {
        let username = request.username.as_str();
        if self.renewal.should_renew(&self.dir, username) {
            self.renew(request).await
        } else {
            self.refresh(username).await
        }
    }

    async fn renew(&self, request: &CredentialRequest) -> UserOutcome {
        let username = request.username.as_str();
        let input = match self.dir.read_request(request) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("{username}: request vanished before it could be read");
                return UserOutcome::Skipped;
            }
            Err(e) => {
                error!("{username}: reading {}: {e}", request.path.display());
                return UserOutcome::Failed;
            }
        };

        let produced = match self.producer.produce(username, &input, &self.dir).await {
            Ok(p) => p,
            Err(e) => {
                error!("{username}: credential production failed: {e}");
                return UserOutcome::Failed;
            }
        };

        if !self.actions.is_empty() {
            // actions may run as the owner, so ownership goes on first
            if let Err(e) = prepare(username, &produced.staging, produced.policy) {
                debug!("{username}: staging file rejected before post-actions: {e}");
                return UserOutcome::Failed;
            }
            match self.users.lookup(username) {
                Some(user) => {
                    let ctx = ActionContext {
                        username,
                        uid: user.uid,
                        gid: user.gid,
                        home: &user.home,
                        credential: &produced.staging,
                    };
                    let summary = self.actions.run_all(&ctx).await;
                    debug!(
                        "{username}: {}/{} post-action(s) succeeded",
                        summary.ran - summary.failed,
                        summary.ran
                    );
                }
                None => warn!("{username}: not in passwd database; post-actions skipped"),
            }
        }

        let target = self.dir.derived_path(username);
        match install(username, &produced.staging, &target, produced.policy) {
            Ok(()) => {
                info!("{username}: installed new credential {}", target.display());
                UserOutcome::Renewed
            }
            Err(e) => {
                debug!("{username}: install aborted, previous credential kept: {e}");
                UserOutcome::Failed
            }
        }
    }

    /// Re-run post-actions against the existing credential.
    async fn refresh(&self, username: &str) -> UserOutcome {
        if self.actions.is_empty() {
            debug!("{username}: credential is fresh");
            return UserOutcome::Skipped;
        }
        let Some(user) = self.users.lookup(username) else {
            warn!("{username}: not in passwd database; liveness refresh skipped");
            return UserOutcome::Skipped;
        };
        let credential = self.dir.derived_path(username);
        let ctx = ActionContext {
            username,
            uid: user.uid,
            gid: user.gid,
            home: &user.home,
            credential: &credential,
        };
        let summary = self.actions.run_all(&ctx).await;
        debug!("{username}: liveness refresh ran {} action(s)", summary.ran);
        UserOutcome::Refreshed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
