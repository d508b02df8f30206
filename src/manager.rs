//! Connectivity orchestration across transports
//!
//! Composes discovery, the per-transport connection machines, and the
//! last-known-endpoint store. Startup: discovery begins unconditionally on
//! both transports; a remembered network bridge is dialed directly while
//! discovery catches up; discovery matches are routed to the machines
//! without duplicating an in-flight attempt.

use crate::connection::ConnectionMachine;
use crate::discovery::DiscoveryEngine;
use crate::store::LastEndpointStore;
use bridgelink_shared::{ConnectError, ConnectionState, DiscoveryEvent, Endpoint, TransportKind};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type EventSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<DiscoveryEvent>>>>;

/// Owns the connectivity core and sequences its startup
pub struct ConnectivityManager {
    network: Arc<ConnectionMachine>,
    ble: Arc<ConnectionMachine>,
    network_discovery: DiscoveryEngine,
    ble_discovery: DiscoveryEngine,
    discovery_events: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    store: LastEndpointStore,
    event_subscribers: EventSubscribers,
    task: Option<JoinHandle<()>>,
}

impl ConnectivityManager {
    pub fn new(
        network: ConnectionMachine,
        ble: ConnectionMachine,
        network_discovery: DiscoveryEngine,
        ble_discovery: DiscoveryEngine,
        discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        store: LastEndpointStore,
    ) -> Self {
        Self {
            network: Arc::new(network),
            ble: Arc::new(ble),
            network_discovery,
            ble_discovery,
            discovery_events: Some(discovery_events),
            store,
            event_subscribers: Arc::new(Mutex::new(Vec::new())),
            task: None,
        }
    }

    fn machine(&self, transport: TransportKind) -> &Arc<ConnectionMachine> {
        match transport {
            TransportKind::Network => &self.network,
            TransportKind::Ble => &self.ble,
        }
    }

    /// Run the startup protocol and spawn the orchestration loop
    pub async fn start(&mut self) {
        if self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            debug!("connectivity manager already started");
            return;
        }

        // Discovery starts unconditionally, both transports
        self.network_discovery.start();
        self.ble_discovery.start();
        self.network.mark_discovering();
        self.ble.mark_discovering();

        // The remembered bridge gives a fast path while discovery catches up
        if let Some(remembered) = self.store.read() {
            if self.network.is_connected() {
                debug!(endpoint = %remembered, "already connected, skipping remembered bridge");
            } else {
                info!(endpoint = %remembered, "dialing remembered bridge");
                match self.network.connect(remembered).await {
                    Ok(()) => {}
                    Err(ConnectError::AlreadyConnecting) => {
                        debug!("an attempt is already in flight")
                    }
                    Err(e) => warn!(error = %e, "remembered-bridge dial rejected"),
                }
            }
        } else {
            debug!("no remembered bridge endpoint");
        }

        let events = match self.discovery_events.take() {
            Some(events) => events,
            None => {
                warn!("orchestration loop ended previously, not restarting");
                return;
            }
        };

        self.task = Some(tokio::spawn(orchestrate(
            events,
            Arc::clone(&self.network),
            Arc::clone(&self.ble),
            self.store.clone(),
            Arc::clone(&self.event_subscribers),
        )));
    }

    /// Halt discovery and orchestration. Established connections stay up
    /// until explicitly disconnected.
    pub fn stop(&mut self) {
        self.network_discovery.stop();
        self.ble_discovery.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub async fn connect(&self, endpoint: Endpoint) -> Result<(), ConnectError> {
        self.machine(endpoint.transport).connect(endpoint).await
    }

    pub async fn disconnect(&self, transport: TransportKind) {
        self.machine(transport).disconnect().await
    }

    /// Ordered connection-state transitions for one transport
    pub fn subscribe(&self, transport: TransportKind) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.machine(transport).subscribe()
    }

    /// Discovery events (found, lost, degraded) across both transports
    pub fn events(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.event_subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn state(&self, transport: TransportKind) -> ConnectionState {
        self.machine(transport).state()
    }

    pub fn is_connected(&self, transport: TransportKind) -> bool {
        self.machine(transport).is_connected()
    }

    pub fn last_known(&self) -> Option<Endpoint> {
        self.store.read()
    }
}

impl Drop for ConnectivityManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(subscribers: &EventSubscribers, event: &DiscoveryEvent) {
    if let Ok(mut subs) = subscribers.lock() {
        subs.retain(|sub| sub.send(event.clone()).is_ok());
    }
}

/// Event loop routing discovery matches and attempt resolutions
async fn orchestrate(
    mut discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    network: Arc<ConnectionMachine>,
    ble: Arc<ConnectionMachine>,
    store: LastEndpointStore,
    subscribers: EventSubscribers,
) {
    let mut network_states = network.subscribe();
    let mut ble_states = ble.subscribe();
    // Discovery match recorded while a stale attempt is still resolving
    let mut preferred_network: Option<Endpoint> = None;
    let mut preferred_ble: Option<Endpoint> = None;

    loop {
        tokio::select! {
            event = discovery_events.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => return,
                };
                publish(&subscribers, &event);
                match event {
                    DiscoveryEvent::EndpointFound(endpoint) => {
                        let (machine, preferred) = match endpoint.transport {
                            TransportKind::Network => (&network, &mut preferred_network),
                            TransportKind::Ble => (&ble, &mut preferred_ble),
                        };
                        handle_found(machine, preferred, endpoint).await;
                    }
                    DiscoveryEvent::EndpointLost(endpoint) => {
                        let preferred = match endpoint.transport {
                            TransportKind::Network => &mut preferred_network,
                            TransportKind::Ble => &mut preferred_ble,
                        };
                        if preferred.as_ref() == Some(&endpoint) {
                            *preferred = None;
                        }
                    }
                    DiscoveryEvent::Degraded { transport, reason } => {
                        warn!(%transport, %reason, "discovery degraded");
                    }
                }
            }

            state = network_states.recv() => {
                let state = match state {
                    Some(state) => state,
                    None => return,
                };
                if let ConnectionState::Connected(endpoint) = &state {
                    store.write(endpoint);
                }
                handle_resolution(&network, &mut preferred_network, state).await;
            }

            state = ble_states.recv() => {
                let state = match state {
                    Some(state) => state,
                    None => return,
                };
                handle_resolution(&ble, &mut preferred_ble, state).await;
            }
        }
    }
}

/// Route a discovery match without duplicating an in-flight attempt
async fn handle_found(
    machine: &ConnectionMachine,
    preferred: &mut Option<Endpoint>,
    endpoint: Endpoint,
) {
    match machine.state() {
        ConnectionState::Connecting(current) if current == endpoint => {
            debug!(%endpoint, "in-flight attempt already targets discovered bridge");
        }
        ConnectionState::Connected(current) if current == endpoint => {
            debug!(%endpoint, "already connected to discovered bridge");
        }
        ConnectionState::Connecting(current) => {
            // Discovery outranks the remembered-address attempt; switch once
            // that attempt resolves.
            info!(%endpoint, stale = %current, "discovered bridge preferred over in-flight attempt");
            *preferred = Some(endpoint);
        }
        ConnectionState::Connected(current) => {
            debug!(%endpoint, connected = %current, "ignoring discovery while connected");
        }
        _ => {
            if let Err(e) = machine.connect(endpoint.clone()).await {
                debug!(%endpoint, error = %e, "discovery-driven connect rejected");
            }
        }
    }
}

/// Act when an attempt resolves while a preferred discovery match waits
async fn handle_resolution(
    machine: &ConnectionMachine,
    preferred: &mut Option<Endpoint>,
    state: ConnectionState,
) {
    match state {
        ConnectionState::Failed(_) => {
            if let Some(endpoint) = preferred.take() {
                info!(%endpoint, "stale attempt failed, dialing discovered bridge");
                if let Err(e) = machine.connect(endpoint).await {
                    debug!(error = %e, "handover connect rejected");
                }
            }
        }
        ConnectionState::Connected(current) => match preferred.take() {
            Some(endpoint) if endpoint != current => {
                info!(stale = %current, %endpoint, "abandoning stale connection for discovered bridge");
                machine.disconnect().await;
                if let Err(e) = machine.connect(endpoint).await {
                    debug!(error = %e, "handover connect rejected");
                }
            }
            _ => {}
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MachineConfig;
    use crate::discovery::{BackendEvent, DiscoveryBackend, DiscoveryConfig};
    use crate::store::MemoryKvStore;
    use crate::transport::{BridgeSession, TransportConnector};
    use anyhow::Result;
    use async_trait::async_trait;
    use bridgelink_shared::FailureReason;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct IdleSession;

    #[async_trait]
    impl BridgeSession for IdleSession {
        async fn wait_closed(&mut self) -> String {
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    enum Dial {
        Succeed,
        Hang,
    }

    struct ScriptedConnector {
        kind: TransportKind,
        script: Mutex<VecDeque<Dial>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn new(kind: TransportKind, script: Vec<Dial>) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let connector = Arc::new(Self {
                kind,
                script: Mutex::new(script.into()),
                calls: calls.clone(),
            });
            (connector, calls)
        }
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn name(&self) -> &'static str {
            "Mock"
        }

        async fn connect(
            &self,
            _endpoint: &Endpoint,
        ) -> std::result::Result<Box<dyn BridgeSession>, FailureReason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let dial = self.script.lock().unwrap().pop_front();
            match dial {
                Some(Dial::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Some(Dial::Succeed) | None => Ok(Box::new(IdleSession)),
            }
        }
    }

    struct ScriptedBackend {
        transport: TransportKind,
        events: Vec<BackendEvent>,
    }

    #[async_trait]
    impl DiscoveryBackend for ScriptedBackend {
        fn transport(&self) -> TransportKind {
            self.transport
        }

        async fn run(&self, sightings: mpsc::UnboundedSender<BackendEvent>) -> Result<()> {
            for event in &self.events {
                let _ = sightings.send(event.clone());
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn test_machine_config() -> MachineConfig {
        MachineConfig {
            connect_timeout: Duration::from_millis(100),
            disconnect_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            unavailable_backoff: Duration::from_millis(200),
        }
    }

    struct Fixture {
        manager: ConnectivityManager,
        network_calls: Arc<AtomicUsize>,
        store: LastEndpointStore,
    }

    fn fixture(
        remembered: Option<&Endpoint>,
        network_script: Vec<Dial>,
        network_sightings: Vec<BackendEvent>,
    ) -> Fixture {
        let store = LastEndpointStore::new(Arc::new(MemoryKvStore::new()));
        if let Some(endpoint) = remembered {
            store.write(endpoint);
        }

        let (network_connector, network_calls) =
            ScriptedConnector::new(TransportKind::Network, network_script);
        let (ble_connector, _) = ScriptedConnector::new(TransportKind::Ble, Vec::new());
        let network = ConnectionMachine::new(network_connector, test_machine_config());
        let ble = ConnectionMachine::new(ble_connector, test_machine_config());

        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let discovery_config = DiscoveryConfig {
            initial_retry: Duration::from_millis(10),
            max_retry: Duration::from_millis(40),
        };
        let network_discovery = DiscoveryEngine::new(
            Arc::new(ScriptedBackend {
                transport: TransportKind::Network,
                events: network_sightings,
            }),
            discovery_config.clone(),
            discovery_tx.clone(),
        );
        let ble_discovery = DiscoveryEngine::new(
            Arc::new(ScriptedBackend {
                transport: TransportKind::Ble,
                events: Vec::new(),
            }),
            discovery_config,
            discovery_tx,
        );

        let manager = ConnectivityManager::new(
            network,
            ble,
            network_discovery,
            ble_discovery,
            discovery_rx,
            store.clone(),
        );

        Fixture {
            manager,
            network_calls,
            store,
        }
    }

    async fn wait_for_connected(
        states: &mut mpsc::UnboundedReceiver<ConnectionState>,
    ) -> Endpoint {
        timeout(Duration::from_secs(2), async {
            loop {
                match states.recv().await {
                    Some(ConnectionState::Connected(endpoint)) => break endpoint,
                    Some(_) => {}
                    None => panic!("state stream ended"),
                }
            }
        })
        .await
        .expect("never connected")
    }

    #[tokio::test]
    async fn test_startup_dials_remembered_bridge_exactly_once() {
        let remembered = Endpoint::network("192.168.1.10:8080");
        // The in-flight dial hangs so discovery reports the same endpoint
        // while the attempt is still pending.
        let mut fx = fixture(
            Some(&remembered),
            vec![Dial::Hang],
            vec![BackendEvent::Found(remembered.clone())],
        );

        fx.manager.start().await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.network_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.manager.state(TransportKind::Network),
            ConnectionState::Connecting(remembered)
        );
        assert!(fx.manager.network_discovery.is_running());
        assert!(fx.manager.ble_discovery.is_running());
    }

    #[tokio::test]
    async fn test_startup_without_remembered_bridge_only_discovers() {
        let mut fx = fixture(None, Vec::new(), Vec::new());

        fx.manager.start().await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.network_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            fx.manager.state(TransportKind::Network),
            ConnectionState::Discovering
        );
        assert!(fx.manager.network_discovery.is_running());
    }

    #[tokio::test]
    async fn test_discovery_match_connects_and_updates_store() {
        let bridge = Endpoint::network("192.168.1.20:8080");
        let mut fx = fixture(
            None,
            vec![Dial::Succeed],
            vec![BackendEvent::Found(bridge.clone())],
        );

        let mut states = fx.manager.subscribe(TransportKind::Network);
        fx.manager.start().await;

        let connected = wait_for_connected(&mut states).await;
        assert_eq!(connected, bridge);

        // The store write rides the orchestrator's own subscription
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.store.read(), Some(bridge));
    }

    #[tokio::test]
    async fn test_discovered_bridge_takes_over_after_stale_attempt_fails() {
        let stale = Endpoint::network("192.168.1.10:8080");
        let live = Endpoint::network("192.168.1.30:8080");
        // First dial (remembered address) hangs until the connect timeout;
        // the second (discovered bridge) succeeds.
        let mut fx = fixture(
            Some(&stale),
            vec![Dial::Hang, Dial::Succeed],
            vec![BackendEvent::Found(live.clone())],
        );

        let mut states = fx.manager.subscribe(TransportKind::Network);
        fx.manager.start().await;

        let connected = wait_for_connected(&mut states).await;
        assert_eq!(connected, live);
        assert_eq!(fx.network_calls.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.store.read(), Some(live));
    }

    #[tokio::test]
    async fn test_user_connect_and_disconnect_pass_through() {
        let bridge = Endpoint::network("192.168.1.40:8080");
        let mut fx = fixture(None, vec![Dial::Succeed], Vec::new());

        let mut states = fx.manager.subscribe(TransportKind::Network);
        fx.manager.start().await;

        fx.manager.connect(bridge.clone()).await.unwrap();
        let connected = wait_for_connected(&mut states).await;
        assert_eq!(connected, bridge);
        assert!(fx.manager.is_connected(TransportKind::Network));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.manager.last_known(), Some(bridge));

        fx.manager.disconnect(TransportKind::Network).await;
        assert_eq!(
            fx.manager.state(TransportKind::Network),
            ConnectionState::Idle
        );
    }

    #[tokio::test]
    async fn test_stop_halts_discovery() {
        let mut fx = fixture(None, Vec::new(), Vec::new());
        fx.manager.start().await;
        assert!(fx.manager.network_discovery.is_running());

        fx.manager.stop();
        assert!(!fx.manager.network_discovery.is_running());
        assert!(!fx.manager.ble_discovery.is_running());
    }
}
