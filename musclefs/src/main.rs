use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use muscle::block::Factory;
use muscle::config::Config;
use muscle::storage::{from_addr, DiskStore, PairedStore};
use muscle::tree::{Store as TreeStore, Tree};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use musclefs::dispatcher::{LevelHandle, Server};

#[derive(Parser)]
#[command(name = "musclefs", about = "9P file server over an encrypted content-addressed store")]
struct Args {
    /// Base directory for configuration, pointer files and cache
    #[arg(long, default_value_os_t = default_base())]
    base: PathBuf,
}

fn default_base() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lib")
        .join("muscle")
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("musclefs: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let level: LevelHandle = Box::new(move |name: &str| {
        let filter = EnvFilter::try_new(name).map_err(|e| e.to_string())?;
        reload_handle.reload(filter).map_err(|e| e.to_string())
    });

    let cfg = Config::load(&args.base)?;
    let key = cfg.encryption_key_bytes()?;

    let remote = from_addr(&cfg.remote_store).await?;
    let staging = Arc::new(DiskStore::new(cfg.staging_dir_path()).await?);
    let cache = Arc::new(DiskStore::new(cfg.cache_dir_path()).await?);
    let paired =
        Arc::new(PairedStore::new(cache, remote, &cfg.propagation_log_path()).await?);
    // There may be blocks left to propagate from a previous run; start the
    // propagator before the first local write, not after.
    paired.spawn_propagator();

    let factory = Factory::new(staging, paired.clone(), &key, cfg.block_size)?;
    let store = Arc::new(TreeStore::new(factory, &args.base).await?);
    let tree = Tree::with_root(store.clone(), cfg.snapshot_frequency()).await?;
    let server = Server::new(tree, store, paired, Some(level)).await;

    {
        let server = server.clone();
        let listen_net = cfg.listen_net.clone();
        let listen_addr = cfg.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = listen(server, &listen_net, &listen_addr).await {
                eprintln!("musclefs: listener: {}", e);
                std::process::exit(1);
            }
        });
    }

    {
        let server = server.clone();
        let frequency = cfg.snapshot_frequency();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(frequency);
            ticks.tick().await; // the immediate first tick
            loop {
                ticks.tick().await;
                if let Err(e) = server.flush_tree(true).await {
                    warn!("could not flush: {}", e);
                }
            }
        });
    }

    // Wait for a signal, flush, exit. A failed flush keeps the server up
    // rather than dropping dirty state on the floor.
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("final clean-up");
        match server.flush_tree(false).await {
            Ok(()) => break,
            Err(e) => warn!("could not flush: {}", e),
        }
    }
    Ok(())
}

async fn listen(
    server: Arc<Server>,
    net: &str,
    addr: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match net {
        "tcp" => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr, "listening");
            loop {
                let (stream, peer) = listener.accept().await?;
                info!(%peer, "client connected");
                tokio::spawn(server.clone().serve_connection(stream));
            }
        }
        "unix" => {
            let listener = tokio::net::UnixListener::bind(addr)?;
            info!(addr, "listening");
            loop {
                let (stream, _) = listener.accept().await?;
                info!("client connected");
                tokio::spawn(server.clone().serve_connection(stream));
            }
        }
        other => Err(format!("unsupported listen-net: {:?}", other).into()),
    }
}
