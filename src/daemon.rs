use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use crate::config::{Config, ConfigOverrides};
use crate::sync_client::HttpSyncClient;
use crate::sync_loop;

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
}

pub struct ThreadedDaemonHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<Result<()>>>,
}

impl ThreadedDaemonHandle {
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(res) => res,
                Err(_) => anyhow::bail!("syftbox-rs daemon thread panicked"),
            }
        } else {
            Ok(())
        }
    }
}

/// Runs the sync loop on the *current* tokio runtime until `stop` is set.
/// The datasites tree and journal under `cfg.data_dir` are created if
/// missing so a brand-new install has somewhere to work from.
pub async fn run_daemon_with_shutdown(cfg: Config, opts: DaemonOptions, stop: Arc<AtomicBool>) -> Result<()> {
    let log_path = opts.log_path.unwrap_or_else(|| daemon_log_path(&cfg));
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    cfg.save()?;

    let root = cfg.data_dir.clone();
    std::fs::create_dir_all(root.join("datasites")).context("create datasites directory")?;
    crate::journal::LocalState::load_or_init(&root)?;

    let client: Arc<dyn crate::sync_client::SyncClient> =
        Arc::new(HttpSyncClient::new(&cfg.server_url)?);

    sync_loop::run(&root, &cfg, client, stop).await
}

/// Starts the daemon in a dedicated background thread with its own tokio
/// runtime, for embedding in other Rust applications that don't want to own
/// the sync loop's async lifecycle directly.
pub fn start_threaded(cfg: Config, opts: DaemonOptions) -> Result<ThreadedDaemonHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let join = thread::Builder::new()
        .name("syftbox-rs-daemon".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
                .context("build tokio runtime")?;
            rt.block_on(run_daemon_with_shutdown(cfg, opts, stop_thread))
        })
        .context("spawn syftbox-rs daemon thread")?;

    Ok(ThreadedDaemonHandle {
        stop,
        join: Some(join),
    })
}

/// Convenience: load config with overrides (matching the CLI's precedence
/// rules) and then start a background daemon thread.
pub fn start_threaded_from_config_path(
    config_path: &std::path::Path,
    overrides: ConfigOverrides,
    opts: DaemonOptions,
) -> Result<ThreadedDaemonHandle> {
    let cfg = Config::load_with_overrides(config_path, overrides)?;
    start_threaded(cfg, opts)
}

fn daemon_log_path(cfg: &Config) -> PathBuf {
    if let Some(p) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return p.join("logs").join("syftbox.log");
    }
    cfg.data_dir
        .join(".syftbox")
        .join("logs")
        .join("syftbox.log")
}
