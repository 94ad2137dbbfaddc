//! Wiring from configuration to a running monitor, plus signal handling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use crate::config::{CredmonConfig, HostRole};
use crate::layout::CredDir;
use crate::monitor::Monitor;
use crate::post_action::PostActionRunner;
use crate::privilege::{SystemUsers, UserDb};
use crate::producer::select_backend;
use crate::reaper::{Elevation, Reaper};
use crate::renewal::RenewalPolicy;
use crate::scheduler::owner_source;

/// Build the monitor described by `config`, operating on `dir`.
///
/// Backend capability detection and post-action validation happen here,
/// once, so a misconfiguration surfaces before the first cycle.
pub fn build_monitor(
    config: &CredmonConfig,
    dir: CredDir,
    shutdown: watch::Receiver<bool>,
) -> Result<Monitor> {
    build_monitor_with_users(config, dir, shutdown, Arc::new(SystemUsers))
}

pub fn build_monitor_with_users(
    config: &CredmonConfig,
    dir: CredDir,
    shutdown: watch::Receiver<bool>,
    users: Arc<dyn UserDb>,
) -> Result<Monitor> {
    let producer =
        select_backend(config, users.clone()).context("selecting credential backend")?;

    let role = config.effective_role();
    let actions = PostActionRunner::for_role(&config.post_actions, role)
        .context("configuring post-actions")?;
    info!("host role {role:?}, {} post-action(s)", actions.len());

    let mut monitor = Monitor::new(dir.clone(), producer, users, shutdown).with_actions(actions);
    if let Some(secs) = config.renewal.threshold_secs {
        monitor = monitor.with_renewal(RenewalPolicy::new(Duration::from_secs(secs)));
    }
    info!("renewal threshold {:?}", monitor.renewal().threshold());

    if config.reaper.enabled && role == HostRole::Scheduler {
        let elevation = if config.reaper.elevate {
            Elevation::Root
        } else {
            Elevation::Inherit
        };
        monitor = monitor.with_reaper(Reaper::new(dir, owner_source(&config.scheduler), elevation));
    } else {
        info!("dead-credential reaping disabled on this host");
    }

    Ok(monitor)
}

/// Install signal handlers.
///
/// SIGHUP is forwarded on the returned reload channel; SIGTERM, SIGQUIT
/// and SIGINT send `true` on `shutdown`.
pub fn install_signal_handlers(shutdown: watch::Sender<bool>) -> Result<watch::Receiver<()>> {
    let (reload_tx, reload_rx) = watch::channel(());

    let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hup.recv() => {
                    info!("SIGHUP received");
                    let _ = reload_tx.send(());
                }
                _ = term.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = quit.recv() => {
                    info!("SIGQUIT received");
                    break;
                }
                _ = int.recv() => {
                    info!("SIGINT received");
                    break;
                }
            }
        }
        let _ = shutdown.send(true);
    });

    Ok(reload_rx)
}
