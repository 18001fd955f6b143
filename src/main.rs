//! peerlink binary
//!
//! `node` runs a coordinator against a configured broker; `relay` runs the
//! WebSocket relay broker that nodes connect to.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use peerlink::channel::ConnectionManager;
use peerlink::cli::{Cli, Commands, ConfigSubcommand};
use peerlink::config::{self, PeerlinkConfig};
use peerlink::coordinator::{CoordinatorEvent, CoordinatorState, LeaveReason, PeerCoordinator};
use peerlink::discovery::{BrokerLocationSource, ServiceDirectory, ServiceDiscovery};
use peerlink::logging::{self, LogGuards};
use peerlink::protocol::Body;
use peerlink::transport::{BusConnector, BusRelay, FailoverUri, MemoryNetwork, WsConnector, MEMORY_SCHEME};
use peerlink::version;
use peerlink::{Error, Result};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Node {
            config,
            server_id,
            broker,
            ping_rate,
            say,
        } => {
            let mut cfg = PeerlinkConfig::load(config.as_deref())?;
            if let Some(id) = server_id {
                cfg.node.server_id = Some(id);
            }
            if let Some(address) = broker {
                cfg.broker.address = Some(address);
            }
            if let Some(rate) = ping_rate {
                cfg.coordination.ping_rate_secs = rate;
            }
            cfg.validate()?;

            let _log_guards = init_logging_from_config(&cfg, cli.verbose, cli.quiet)?;
            log_startup("node");
            build_runtime()?.block_on(node_main(cfg, say))
        }
        Commands::Relay { config, listen } => {
            let mut cfg = PeerlinkConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                cfg.relay.listen = listen;
            }

            let _log_guards = init_logging_from_config(&cfg, cli.verbose, cli.quiet)?;
            log_startup("relay");
            build_runtime()?.block_on(relay_main(cfg))
        }
    }
}

fn init_logging_from_config(config: &PeerlinkConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

fn log_startup(mode: &str) {
    let build = version::build_info();
    info!(
        mode,
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting peerlink"
    );
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .thread_name("peerlink")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))
}

/// memory:// brokers only exist inside this process, so a node pointed at
/// them gets its own in-process network
fn connector_for(address: &str, config: &PeerlinkConfig) -> Result<Arc<dyn BusConnector>> {
    let uri = FailoverUri::from_address(address, &config.failover_policy())?;
    let memory: Vec<&str> = uri
        .urls
        .iter()
        .filter_map(|u| u.strip_prefix(MEMORY_SCHEME))
        .collect();

    if memory.is_empty() {
        return Ok(Arc::new(WsConnector::new(config.connect_timeout())));
    }
    if memory.len() != uri.urls.len() {
        return Err(Error::config_field_invalid(
            "broker.address",
            "cannot mix memory:// and ws:// brokers",
        ));
    }

    let network = MemoryNetwork::new();
    for name in memory {
        network.add_broker(name);
    }
    warn!("Using an in-process memory broker; no other process can join");
    Ok(Arc::new(network.connector()))
}

async fn node_main(config: PeerlinkConfig, mut say: Option<String>) -> Result<()> {
    let address = config.broker.address.clone().ok_or_else(|| {
        Error::config_field_invalid("broker.address", "a broker address is required to run a node")
    })?;
    let connector = connector_for(&address, &config)?;

    let directory = Arc::new(ServiceDirectory::new());
    let location = BrokerLocationSource::new(config.broker.service_id.clone());
    location.attach(directory.clone() as Arc<dyn ServiceDiscovery>);
    directory.announce(&config.broker.service_id, &address);

    let manager = Arc::new(ConnectionManager::new(
        connector,
        location.clone(),
        config.failover_policy(),
    ));

    let (event_tx, mut events) = mpsc::channel(config.coordination.event_queue_size);
    let coordinator = PeerCoordinator::new(config.coordinator_settings(), manager, event_tx);
    info!(
        server_id = %coordinator.server_id(),
        plugin_id = %coordinator.plugin_id(),
        broker = %address,
        "Node configured"
    );

    coordinator.start()?;
    if config.coordination.ping_rate_secs > 0 {
        coordinator.set_ping_rate(config.coordination.ping_rate_secs).await;
    }

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut outcome = Ok(());
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            event = events.recv() => {
                match event {
                    Some(CoordinatorEvent::StateChanged(CoordinatorState::Running)) => {
                        info!(server_id = %coordinator.server_id(), "Coordinator running");
                        if let Some(text) = say.take() {
                            if let Err(e) = coordinator.broadcast(Body::Text(text)).await {
                                warn!(error = %e, "Broadcast failed");
                            }
                        }
                    }
                    Some(CoordinatorEvent::StateChanged(CoordinatorState::Failed)) => {
                        error!(server_id = %coordinator.server_id(), "Coordinator failed");
                        outcome = Err(Error::StartupFailed {
                            message: "coordinator entered the failed state".to_string(),
                        });
                        break;
                    }
                    Some(CoordinatorEvent::StateChanged(state)) => {
                        info!(state = %state, "Coordinator state changed");
                    }
                    Some(CoordinatorEvent::PeerJoined { server_id, start_time }) => {
                        info!(peer = %server_id, start_time, "Peer joined");
                    }
                    Some(CoordinatorEvent::PeerLeft { server_id, reason }) => {
                        match reason {
                            LeaveReason::Departed => info!(peer = %server_id, "Peer left"),
                            LeaveReason::TimedOut => warn!(peer = %server_id, "Peer timed out"),
                        }
                    }
                    Some(CoordinatorEvent::Message { from, body }) => match body {
                        Body::Text(text) => info!(from = %from, text = %text, "Message"),
                        other => info!(from = %from, body = ?other, "Message"),
                    },
                    None => {
                        info!("Coordinator event channel closed");
                        break;
                    }
                }
            }
        }
    }

    coordinator.stop().await;
    location.detach();
    info!("Node shut down");
    outcome
}

async fn relay_main(config: PeerlinkConfig) -> Result<()> {
    let relay = BusRelay::bind(&config.relay.listen).await?;
    info!(url = %relay.url()?, "Relay listening");

    tokio::select! {
        _ = relay.run() => {
            warn!("Relay stopped accepting connections");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = PeerlinkConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            PeerlinkConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
