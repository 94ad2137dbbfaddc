//! credmon: privileged credential monitor.
//!
//! Runs as root. Every poll interval (or on SIGHUP) it scans the credential
//! directory, derives ticket caches or signed tokens for stale requests,
//! installs them atomically and reaps credentials of users without jobs.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use credmon::config::{CredmonConfig, load_config};
use credmon::layout::CredDir;
use credmon::supervisor::{build_monitor, install_signal_handlers};
use log::{LevelFilter, error, info, warn};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(
    name = "credmon",
    version,
    about = "Derive and install per-user credentials for batch jobs"
)]
struct Cli {
    /// Configuration file (default: /etc/credmon/credmon.toml)
    #[arg(short, long, env = "CREDMON_CONFIG")]
    config: Option<PathBuf>,

    /// Credential directory, overrides `cred_dir` from the config
    #[arg(long)]
    cred_dir: Option<PathBuf>,

    /// Log file, overrides `logging.file` from the config
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(short, long)]
    foreground: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Run a single scan cycle and exit
    #[arg(long)]
    once: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    match try_main(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("startup failed: {err:#}");
            eprintln!("credmon: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn try_main(cli: Cli) -> Result<i32> {
    let loaded = load_config(cli.config.as_deref())?;
    let mut config = loaded.config;
    if let Some(dir) = &cli.cred_dir {
        config.cred_dir = dir.display().to_string();
    }
    if let Some(file) = &cli.log_file {
        config.logging.file = Some(file.display().to_string());
    }

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(0);
    }

    let dir = CredDir::new(config.cred_dir_path()?);
    let dir_ready = match dir.ensure() {
        Ok(()) => true,
        Err(e) if config.startup.strict => {
            return Err(e)
                .with_context(|| format!("preparing credential directory {}", dir.root().display()));
        }
        Err(e) => {
            eprintln!(
                "credmon: credential directory {} unusable: {e}",
                dir.root().display()
            );
            false
        }
    };

    init_logging(&config, &dir, cli.foreground, cli.verbose)?;
    match &loaded.source {
        Some(path) => info!("loaded configuration from {}", path.display()),
        None => info!("no configuration file found; using defaults"),
    }

    if dir_ready {
        if let Err(e) = dir.write_pid_file(std::process::id()) {
            warn!("failed to write pid file {}: {e}", dir.pid_file().display());
        }
        match dir.remove_stale_staging() {
            Ok(0) => {}
            Ok(n) => info!("removed {n} stale staging file(s)"),
            Err(e) => warn!("failed to clean staging files: {e}"),
        }
    }

    run(config, dir, cli.once).await
}

async fn run(config: CredmonConfig, dir: CredDir, once: bool) -> Result<i32> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reload = install_signal_handlers(shutdown_tx)?;
    let monitor = build_monitor(&config, dir, shutdown_rx)?;

    if once {
        return match monitor.run_cycle().await {
            Ok(report) => {
                info!("cycle complete: {report}");
                Ok(0)
            }
            Err(e) => {
                error!("cycle failed: {e}");
                Ok(1)
            }
        };
    }

    let interval = Duration::from_secs(config.poll_interval_secs.max(1));
    monitor.run(interval, reload).await;
    info!("credmon exiting");
    Ok(0)
}

fn init_logging(config: &CredmonConfig, dir: &CredDir, foreground: bool, verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => config.logging.level_filter(),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));

    if !foreground {
        let path = match &config.logging.file {
            Some(file) => credmon::config::expand_str_path(file)?,
            None => dir.log_file(),
        };
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .write_style(env_logger::WriteStyle::Never);
            }
            Err(e) if config.startup.strict => {
                bail!("opening log file {}: {e}", path.display());
            }
            Err(e) => {
                eprintln!(
                    "credmon: cannot open log file {}: {e}; logging to stderr",
                    path.display()
                );
            }
        }
    }

    builder.try_init().context("initializing logger")?;
    Ok(())
}
