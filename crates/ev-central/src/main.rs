//! EV-Central coordinator entry point.
//!
//! Loads the configuration, builds the record store and the coordinator,
//! and serves both peer transports until Ctrl-C or an operator `quit`.
//!
//! # Usage
//!
//! ```text
//! ev-central [OPTIONS]
//!
//! Options:
//!   --config <PATH>        TOML configuration file [default: ev-central.toml]
//!   --bind <ADDR>          Address both listeners bind to
//!   --line-port <PORT>     JSON line transport port
//!   --framed-port <PORT>   Framed transport port
//!   --storage <PATH>       Charging-point record file
//!   --ephemeral            Keep records in memory only
//!   --no-console           Do not read operator commands from stdin
//!   --init-config          Write the effective configuration and exit
//! ```
//!
//! Flags override the file; the file overrides built-in defaults.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ Coordinator::new(repository)   -- loads CP records
//!  └─ spawn
//!       ├─ run_listener(LineTransport)    (JSON lines)
//!       ├─ run_listener(FramedTransport)  (STX/ETX frames)
//!       └─ run_console                    (stdin, optional)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ev_central::application::coordinator::Coordinator;
use ev_central::application::repository::Repository;
use ev_central::infrastructure::console::run_console;
use ev_central::infrastructure::network::{bind, run_listener, FramedTransport, LineTransport};
use ev_central::infrastructure::storage::config::{load_config, save_config, CentralConfig};
use ev_central::infrastructure::storage::{JsonFileRepository, MemoryRepository};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// EV-Central: coordinates charging points and driver sessions.
#[derive(Debug, Parser)]
#[command(name = "ev-central", about = "Central coordinator for EV charging points", version)]
struct Cli {
    /// TOML configuration file.  A missing file means built-in defaults.
    #[arg(long, default_value = "ev-central.toml", env = "EV_CENTRAL_CONFIG")]
    config: PathBuf,

    /// IP address both listeners bind to.
    #[arg(long, env = "EV_CENTRAL_BIND")]
    bind: Option<String>,

    /// Port of the newline-delimited JSON transport.
    #[arg(long, env = "EV_CENTRAL_LINE_PORT")]
    line_port: Option<u16>,

    /// Port of the framed transport.
    #[arg(long, env = "EV_CENTRAL_FRAMED_PORT")]
    framed_port: Option<u16>,

    /// JSON file holding charging-point records.
    #[arg(long, env = "EV_CENTRAL_STORAGE")]
    storage: Option<PathBuf>,

    /// Keep charging-point records in memory only.
    #[arg(long)]
    ephemeral: bool,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_console: bool,

    /// Write the effective configuration to `--config` and exit.
    #[arg(long)]
    init_config: bool,
}

impl Cli {
    /// Applies command-line overrides on top of `config`.
    fn apply(&self, mut config: CentralConfig) -> CentralConfig {
        if let Some(bind) = &self.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = self.line_port {
            config.network.line_port = port;
        }
        if let Some(port) = self.framed_port {
            config.network.framed_port = port;
        }
        if let Some(path) = &self.storage {
            config.storage.path = path.clone();
        }
        if self.ephemeral {
            config.storage.enabled = false;
        }
        if self.no_console {
            config.central.console = false;
        }
        config
    }
}

fn build_repository(config: &CentralConfig) -> Arc<dyn Repository> {
    if config.storage.enabled {
        info!("charging point records stored in {}", config.storage.path.display());
        Arc::new(JsonFileRepository::new(&config.storage.path))
    } else {
        info!("charging point records kept in memory only");
        Arc::new(MemoryRepository::new())
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let config = cli.apply(file_config);

    if cli.init_config {
        save_config(&cli.config, &config)
            .with_context(|| format!("writing configuration to {}", cli.config.display()))?;
        println!("configuration written to {}", cli.config.display());
        return Ok(());
    }

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.central.log_level)),
        )
        .init();

    info!("EV-Central starting");

    let repository = build_repository(&config);
    let coordinator = Arc::new(Coordinator::new(repository, config.coordinator_settings()));
    let running = Arc::new(AtomicBool::new(true));

    // ── Listeners ─────────────────────────────────────────────────────────────
    let bind_address = &config.network.bind_address;
    let line_listener = bind(&format!("{bind_address}:{}", config.network.line_port), "line").await?;
    let framed_listener = bind(&format!("{bind_address}:{}", config.network.framed_port), "framed").await?;

    let framed = FramedTransport::new(config.protocol.ack_timeout(), config.protocol.idle_timeout());
    let line_task = tokio::spawn(run_listener(
        line_listener,
        Arc::new(LineTransport),
        Arc::clone(&coordinator),
        Arc::clone(&running),
    ));
    let framed_task = tokio::spawn(run_listener(
        framed_listener,
        Arc::new(framed),
        Arc::clone(&coordinator),
        Arc::clone(&running),
    ));

    // ── Operator console ──────────────────────────────────────────────────────
    if config.central.console {
        tokio::spawn(run_console(Arc::clone(&coordinator), Arc::clone(&running)));
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl-C: {e}"),
        }
    });

    info!("EV-Central ready");
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for (name, task) in [("line", line_task), ("framed", framed_task)] {
        if let Err(e) = task.await {
            error!("{name} accept loop ended abnormally: {e}");
        }
    }
    info!("EV-Central stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_leave_file_values_untouched() {
        // Arrange
        let cli = Cli::parse_from(["ev-central"]);
        let mut file = CentralConfig::default();
        file.network.line_port = 7000;

        // Act
        let config = cli.apply(file.clone());

        // Assert
        assert_eq!(config, file);
    }

    #[test]
    fn test_cli_flags_override_file() {
        // Arrange
        let cli = Cli::parse_from([
            "ev-central",
            "--bind",
            "127.0.0.1",
            "--line-port",
            "9100",
            "--framed-port",
            "9199",
            "--storage",
            "/tmp/cps.json",
            "--no-console",
        ]);

        // Act
        let config = cli.apply(CentralConfig::default());

        // Assert
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.network.line_port, 9100);
        assert_eq!(config.network.framed_port, 9199);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/cps.json"));
        assert!(!config.central.console);
        assert!(config.storage.enabled);
    }

    #[test]
    fn test_ephemeral_disables_file_storage() {
        let cli = Cli::parse_from(["ev-central", "--ephemeral"]);
        let config = cli.apply(CentralConfig::default());
        assert!(!config.storage.enabled);
    }
}
