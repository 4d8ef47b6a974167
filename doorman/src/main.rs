#![forbid(unsafe_code)]

mod admission;
mod capture;
mod config;
mod firewall;
mod logging;
mod orchestrator;
mod rate_limit;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use clap::Parser;
use knock_proto::{MasterKey, NonceGuard, TokenVerifier};
use tracing::{info, warn};

use crate::admission::AdmissionEngine;
use crate::capture::{default_route_interface, RawCapture};
use crate::config::Config;
use crate::firewall::{FirewallBackend, FirewallController};
use crate::orchestrator::{Event, Orchestrator};
use crate::rate_limit::RateLimiter;
use crate::store::SqliteScoreStore;

#[derive(Parser, Debug)]
#[command(name = "knockd", version, about = "Single packet authorization daemon")]
struct Cli {
    /// Path to the daemon config (TOML)
    #[arg(long, default_value = "knockd.toml")]
    config: PathBuf,
    /// Append JSON log lines to this file instead of logging to stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Increase verbosity (rejected knocks are logged at debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Quiet mode (warnings and errors only)
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet, cli.log_file.as_deref())?;

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("load {}", cli.config.display()))?;
    cfg.validate().context("invalid config")?;
    run_daemon(cfg)
}

fn master_key(cfg: &Config) -> Result<MasterKey> {
    if let Some(key) = cfg.master_key()? {
        return Ok(key);
    }
    let key = MasterKey::generate()?;
    warn!("master key not found in config, generated a new one");
    println!("Add the following line to your knockd.toml:");
    println!("key = \"{}\"", key.to_base64());
    Ok(key)
}

fn run_daemon(mut cfg: Config) -> Result<()> {
    let keys = master_key(&cfg)?.derive()?;

    if cfg.iface.is_empty() {
        cfg.iface = default_route_interface().context("pick capture interface; set `iface`")?;
        info!(iface = %cfg.iface, "interface auto-selected");
    }

    let backend = firewall::platform_backend()?;
    backend
        .probe()
        .with_context(|| format!("{} not usable", backend.name()))?;
    let firewall = FirewallController::new(backend)?;

    let scores = Arc::new(
        SqliteScoreStore::open(&cfg.db_file)
            .with_context(|| format!("open score store {}", cfg.db_file.display()))?,
    );
    let nonces = NonceGuard::spawn(cfg.nonce_retention()).context("start nonce sweeper")?;
    let capture = RawCapture::open(&cfg.iface)?;

    let (tx, rx) = mpsc::channel();
    {
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(Event::Shutdown);
        })
        .context("install signal handler")?;
    }
    let stop = Arc::new(AtomicBool::new(false));
    let capture_thread = capture
        .spawn(tx, Arc::clone(&stop))
        .context("start capture thread")?;

    let orchestrator = Orchestrator::new(
        TokenVerifier::new(keys),
        nonces,
        AdmissionEngine::new(cfg.base_ttl_min, cfg.max_ttl_min, Arc::clone(&scores)),
        firewall,
        scores,
        cfg.ports(),
        RateLimiter::new(cfg.rate_pps, cfg.rate_burst),
        cfg.obfuscate_ip,
    );

    info!(
        iface = %cfg.iface,
        ports = ?cfg.ports(),
        base_ttl_min = cfg.base_ttl_min,
        max_ttl_min = cfg.max_ttl_min,
        "knockd is running"
    );
    orchestrator.run(rx);

    stop.store(true, Ordering::Relaxed);
    if capture_thread.join().is_err() {
        warn!("capture thread panicked");
    }
    info!("knockd stopped");
    Ok(())
}
