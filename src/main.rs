//! Stock-record sync daemon for the Koza/Luca accounting backend.
//!
//! Usage:
//!   koza-sync -c /etc/koza-sync/koza_sync.conf
//!   koza-sync -c /etc/koza-sync/koza_sync.conf --once --stderr

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use koza_sync::config;
use koza_sync::katana::{self, KatanaClient};
use koza_sync::koza::client::KozaClient;
use koza_sync::koza::jar::CookieJarStore;
use koza_sync::koza::session::SessionManager;
use koza_sync::sync::SyncCoordinator;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "koza-sync", about = "Katana → Koza/Luca stock-record sync")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/koza-sync/koza_sync.conf")]
    config: PathBuf,

    /// Run one sync and exit instead of looping on sync_interval.
    #[arg(long)]
    once: bool,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("koza-sync: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("koza-sync: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    setup_logging(use_syslog).expect("failed to set up logging");

    if let Err(e) = write_pid_file(&cfg.pid_file) {
        error!("cannot write PID file {}: {e}", cfg.pid_file.display());
    }

    let cfg = Arc::new(cfg);
    info!("koza-sync starting (backend: {})", cfg.koza_base_url);

    let store = Arc::new(CookieJarStore::new());
    let session = match SessionManager::new(Arc::clone(&cfg), store) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("cannot initialize Koza session manager: {e}");
            process::exit(1);
        }
    };
    let koza = Arc::new(KozaClient::new(Arc::clone(&session)));
    let katana = match KatanaClient::new(&cfg) {
        Ok(k) => k,
        Err(e) => {
            error!("cannot initialize Katana client: {e}");
            process::exit(1);
        }
    };

    // SIGINT flips the shutdown flag; long operations notice it between
    // records and degrade gracefully instead of aborting mid-create.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown requested; finishing current record");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let coordinator = SyncCoordinator::new(koza, Arc::clone(&shutdown));

    loop {
        match run_sync(&katana, &coordinator).await {
            Ok(()) => {}
            Err(e) => error!("sync run failed: {e}"),
        }
        if cli.once || shutdown.load(Ordering::Relaxed) {
            break;
        }
        info!("next sync in {}s", cfg.sync_interval);
        tokio::time::sleep(std::time::Duration::from_secs(cfg.sync_interval)).await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    info!("koza-sync exiting");
}

async fn run_sync(katana: &KatanaClient, coordinator: &SyncCoordinator) -> anyhow::Result<()> {
    let products = katana.list_products().await?;
    let candidates = katana::to_candidates(&products);
    info!("{} stock-card candidates from {} products", candidates.len(), products.len());

    let report = coordinator.sync_stock_cards(&candidates).await?;
    info!(
        "sync finished in {:.1}s: {} (processed {}, attempts {})",
        report.duration.as_secs_f64(),
        report.message,
        report.processed,
        report.sent_attempts,
    );
    for err in &report.errors {
        warn!("record error: {err}");
    }
    if !report.is_success() {
        warn!("sync completed with {} hard failures", report.failed);
    }
    Ok(())
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "koza-sync".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }
    Ok(())
}

fn write_pid_file(path: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    writeln!(f, "{}", process::id())?;
    Ok(())
}
