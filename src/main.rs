mod connection;
mod discovery;
mod manager;
mod store;
mod transport;

use connection::{ConnectionMachine, MachineConfig};
use discovery::{BleBackend, BleScanConfig, DiscoveryConfig, DiscoveryEngine, MdnsBackend};
use manager::ConnectivityManager;
use store::{FileKvStore, LastEndpointStore};
use transport::{BleConnector, TcpConnector};

use bridgelink_shared::{ConnectionState, DiscoveryEvent, TransportKind};
use std::sync::Arc;
use tokio::sync::mpsc;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let store = LastEndpointStore::new(Arc::new(FileKvStore::open(FileKvStore::default_path())));

    info!("BridgeLink starting");
    if let Some(remembered) = store.read() {
        info!("  remembered bridge: {}", remembered);
    }

    let machine_config = MachineConfig::default();
    let network = ConnectionMachine::new(Arc::new(TcpConnector::new()), machine_config.clone());
    let ble = ConnectionMachine::new(Arc::new(BleConnector::new()), machine_config);

    let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
    let discovery_config = DiscoveryConfig::default();
    let network_discovery = DiscoveryEngine::new(
        Arc::new(MdnsBackend::default()),
        discovery_config.clone(),
        discovery_tx.clone(),
    );
    let ble_discovery = DiscoveryEngine::new(
        Arc::new(BleBackend::new(BleScanConfig::default())),
        discovery_config,
        discovery_tx,
    );

    let mut manager = ConnectivityManager::new(
        network,
        ble,
        network_discovery,
        ble_discovery,
        discovery_rx,
        store,
    );

    // Subscribe before starting so no transition is missed
    let mut network_states = manager.subscribe(TransportKind::Network);
    let mut ble_states = manager.subscribe(TransportKind::Ble);
    let mut events = manager.events();

    manager.start().await;

    // Main event loop
    loop {
        tokio::select! {
            Some(state) = network_states.recv() => log_state(TransportKind::Network, &state),
            Some(state) = ble_states.recv() => log_state(TransportKind::Ble, &state),
            Some(event) = events.recv() => match event {
                DiscoveryEvent::EndpointFound(endpoint) => {
                    info!("Discovered {}", endpoint);
                }
                DiscoveryEvent::EndpointLost(endpoint) => {
                    info!("Lost {}", endpoint);
                }
                DiscoveryEvent::Degraded { transport, reason } => {
                    warn!("{} discovery degraded: {}", transport, reason);
                }
            },
            else => break,
        }
    }
}

fn log_state(transport: TransportKind, state: &ConnectionState) {
    match state {
        ConnectionState::Failed(_) => warn!("{}: {}", transport, state),
        _ => info!("{}: {}", transport, state),
    }
}
