use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use syftbox_rs::config::{Config, ConfigOverrides};
use syftbox_rs::daemon::{self, DaemonOptions};
use syftbox_rs::sync_client::HttpSyncClient;
use syftbox_rs::sync_loop;

#[derive(Parser, Debug)]
#[command(name = "syftbox-rs", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync loop continuously, polling every `poll_interval_secs`.
    Daemon,

    /// Run exactly one sync cycle, then exit.
    SyncOnce,

    /// Print the resolved config file path.
    ConfigPath,

    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());
    let overrides = ConfigOverrides {
        email,
        data_dir: datadir,
        server_url: server,
        poll_interval_secs: None,
    };

    match command {
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::SyncOnce) => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_sync_once(cfg).await
        }
        Some(Commands::Daemon) | None => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg).await
        }
    }
}

async fn run_daemon(cfg: Config) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop_signal.store(true, Ordering::SeqCst);
    });
    daemon::run_daemon_with_shutdown(cfg, DaemonOptions::default(), stop).await
}

async fn run_sync_once(cfg: Config) -> Result<()> {
    let root = cfg.data_dir.clone();
    std::fs::create_dir_all(root.join("datasites"))?;
    syftbox_rs::journal::LocalState::load_or_init(&root)?;
    let client = HttpSyncClient::new(&cfg.server_url)?;
    sync_loop::run_once(&root, &cfg, &client).await
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let revision = option_env!("SYFTBOX_REVISION").unwrap_or("HEAD");
    let build_date = option_env!("SYFTBOX_BUILD_DATE").unwrap_or("");
    format!(
        "{} ({}; rust; {}/{}; {})",
        version,
        revision,
        std::env::consts::OS,
        std::env::consts::ARCH,
        build_date
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["syftbox-rs"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn sync_once_cli_parses() {
        let cli = Cli::try_parse_from(["syftbox-rs", "sync-once"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::SyncOnce)));
    }

    #[test]
    fn config_path_cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "syftbox-rs",
            "--config",
            "config.json",
            "--email",
            "alice@example.com",
            "config-path",
        ])
        .unwrap();
        assert_eq!(cli.email.as_deref(), Some("alice@example.com"));
        assert!(matches!(cli.command, Some(Commands::ConfigPath)));
    }
}
