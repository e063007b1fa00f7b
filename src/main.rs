use hq_cluster::config::{CoordinationConfig, PeerConfig};
use hq_cluster::coordination::CoordinationService;
use hq_cluster::network::fault::{FaultInjector, Preset};
use hq_cluster::store::memory::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} [--config <file.json>] [--id <n>] [--port <n>] [--peer <id@host:port>]... [--no-discovery] [--faults <preset>]",
        program
    );
    eprintln!("Example: {} --id 1 --port 5001", program);
    eprintln!(
        "Example: {} --id 2 --port 5002 --peer 1@127.0.0.1:5001 --faults flaky",
        program
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = CoordinationConfig::default();
    let mut id: Option<u32> = None;
    let mut port: Option<u16> = None;
    let mut peers: Vec<PeerConfig> = vec![];
    let mut no_discovery = false;
    let mut faults: Option<Preset> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(path)) => {
                config = CoordinationConfig::load(path)?;
                i += 2;
            }
            ("--id", Some(raw)) => {
                id = Some(raw.parse()?);
                i += 2;
            }
            ("--port", Some(raw)) => {
                port = Some(raw.parse()?);
                i += 2;
            }
            ("--peer", Some(raw)) => {
                peers.push(PeerConfig::parse(raw)?);
                i += 2;
            }
            ("--faults", Some(raw)) => {
                faults = Some(raw.parse()?);
                i += 2;
            }
            ("--no-discovery", _) => {
                no_discovery = true;
                i += 1;
            }
            ("--help" | "-h", _) => usage(&args[0]),
            (other, _) => {
                eprintln!("Unknown or incomplete argument: {}", other);
                usage(&args[0]);
            }
        }
    }

    // Command-line flags override the file.
    if let Some(id) = id {
        config.server_id = id;
    }
    if let Some(port) = port {
        config.tcp_port = port;
    }
    config.peers.extend(peers);
    if no_discovery {
        config.discovery.enabled = false;
    }

    if let Some(preset) = faults {
        FaultInjector::global().set_preset(preset);
    }
    tracing::info!("Fault injection: {}", FaultInjector::global().status());

    // 1. Store and coordination core:
    let store = Arc::new(MemoryStore::new());
    let service = CoordinationService::new(config, store)?;
    let addr = service.start().await?;
    tracing::info!("HQ server #{} ready on {}", service.server_id(), addr);

    // 2. Spawn stats reporter:
    let stats_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let stats = stats_service.server_stats();
            tracing::info!(
                "Server stats: role={} clock={} messages={} connected_nodes={}",
                stats_service.role(),
                stats.logical_time,
                stats.message_count,
                stats.connected_nodes
            );
            for peer in stats_service.peers() {
                tracing::info!(
                    "  - server #{} at {}:{} (claims_leader={})",
                    peer.id,
                    peer.host,
                    peer.port,
                    peer.claims_leader
                );
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    service.shutdown().await;
    Ok(())
}
