//! arraybench: a testbed comparing TCP server concurrency models
//!
//! Three engines serve the same length-prefixed array protocol:
//! - blocking: a thread per connection
//! - nonblocking: readiness loops over mio (epoll/kqueue)
//! - async: io_uring completion dispatchers (Linux only)
//!
//! Every request is sorted on a worker pool and its latency is written as
//! a CSV line on stdout. The client mode generates load and validates
//! responses.

mod client;
mod config;
mod error;
mod metrics;
mod protocol;
mod runtime;
mod transform;

use config::{Config, Mode};
use runtime::Engine;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging on stderr; stdout carries the metrics
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.mode {
        Mode::Client(client_config) => run_client(client_config),
        Mode::Server {
            kind,
            settings,
            limit,
        } => {
            info!(
                addr = %settings.addr,
                engine = ?kind,
                workers = settings.workers,
                limit = ?limit,
                "Starting arraybench server"
            );
            if kind == runtime::EngineKind::Async && !runtime::async_supported() {
                return Err("io_uring is not available on this host".into());
            }
            let engine = runtime::new_engine(kind, settings)?;
            shutdown_on_interrupt(Arc::clone(&engine))?;
            engine.start(limit)?;
            info!(stats = ?engine.stats(), "Server finished");
            Ok(())
        }
    }
}

/// Stop the engine on Ctrl-C so an unbounded run drains its sessions and
/// reports its counters before exiting.
fn shutdown_on_interrupt(engine: Arc<dyn Engine>) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, shutting down");
                    engine.shutdown();
                }
            })
        })?;
    Ok(())
}

/// Run the load generator on a tokio runtime and print its summary.
fn run_client(config: client::ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = rt.block_on(client::run(&config))?;

    println!("{}", client::REPORT_HEADER);
    println!("{}", report.csv_line());
    Ok(())
}
