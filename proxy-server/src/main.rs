//! Single-port WebSocket/HTTP reverse proxy — monoio thread-per-core binary.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod edge_tcp;

use clap::Parser;
use proxy_core::config::GatewayConfig;
use proxy_core::{Client, Proxy};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "uwsrp", version, about = "Single-port WebSocket/HTTP reverse proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG if set).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads; defaults to the number of available cores.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)))
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "uwsrp starting");

    let config = Arc::new(GatewayConfig::load(cli.config.as_ref().and_then(|p| p.to_str()))?);
    info!(
        backend = format!("{}:{}", config.backend.host, config.backend.port),
        edge_port = config.edge.port,
        "configuration loaded"
    );
    if config.backend.warn_https_loopback() {
        tracing::warn!("backend.protocol is https but backend.host is loopback — TLS to localhost is unusual");
    }

    let num_workers = cli.workers.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
    info!(workers = num_workers, "spawning worker threads");

    let handles = spawn_workers(Arc::clone(&config), num_workers);

    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("shutdown signal received, stopping");
    // Workers run an infinite accept loop per thread; on process exit the
    // OS reclaims them. Graceful per-connection drain is left for a future
    // iteration — see DESIGN.md.
    drop(handles);
    Ok(())
}

/// One monoio runtime per core, each with its own `TcpListener` on
/// `edge.port`, `Client` pool, and `Proxy` dispatcher — no state shared
/// across threads (spec §5).
fn spawn_workers(config: Arc<GatewayConfig>, num_workers: usize) -> Vec<std::thread::JoinHandle<()>> {
    (0..num_workers)
        .map(|worker_id| {
            let config = Arc::clone(&config);
            std::thread::Builder::new()
                .name(format!("uwsrp-worker-{worker_id}"))
                .spawn(move || {
                    let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new().enable_all().build().expect("failed to build monoio runtime");
                    rt.block_on(worker_loop(worker_id, config));
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}

async fn worker_loop(worker_id: usize, config: Arc<GatewayConfig>) {
    use monoio::net::TcpListener;

    let addr = format!("0.0.0.0:{}", config.edge.port);
    let listener = TcpListener::bind(&addr).unwrap_or_else(|e| panic!("worker {worker_id} failed to bind {addr}: {e}"));
    info!(worker = worker_id, addr = %addr, "worker listening");

    let client = Rc::new(Client::new(config.client.clone()));
    let edge_is_https = config.edge.ssl.unwrap_or(false);
    let proxy = Rc::new(Proxy::new(Rc::clone(&client), config.backend.clone(), config.proxy.clone(), config.edge.port, edge_is_https));

    {
        let client = Rc::clone(&client);
        let interval = std::time::Duration::from_millis(config.client.connection_watcher_interval_ms);
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(interval).await;
                client.sweep_idle(std::time::Instant::now());
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let proxy = Rc::clone(&proxy);
                monoio::spawn(async move {
                    if let Err(e) = edge_tcp::serve_connection(stream, peer_addr.to_string(), proxy).await {
                        tracing::debug!(error = %e, "edge connection closed");
                    }
                });
            }
            Err(e) => error!(worker = worker_id, error = %e, "accept error"),
        }
    }
}

fn setup_signal_handler() {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
