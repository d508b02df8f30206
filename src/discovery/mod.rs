//! Bridge discovery
//!
//! This module handles:
//! - Continuous background discovery per transport (mDNS browse, BLE scan)
//! - Found/lost dedup so observers see each endpoint at most once until it
//!   disappears
//! - Degraded-transport reporting with backoff retry instead of termination

pub mod ble;
pub mod mdns;

use anyhow::Result;
use async_trait::async_trait;
use bridgelink_shared::{timing, DiscoveryEvent, Endpoint};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use ble::{BleBackend, BleScanConfig};
pub use mdns::{MdnsBackend, BRIDGE_SERVICE_TYPE};

/// Raw sighting reported by a discovery backend, before dedup
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Found(Endpoint),
    Lost(Endpoint),
}

/// One browse session against the underlying transport.
///
/// `run` streams sightings until the session fails or the receiver is
/// dropped; the engine restarts failed sessions with backoff.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    fn transport(&self) -> bridgelink_shared::TransportKind;

    async fn run(&self, sightings: mpsc::UnboundedSender<BackendEvent>) -> Result<()>;
}

/// Configuration for the discovery engine
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Delay before restarting a failed browse session (initial)
    pub initial_retry: Duration,
    /// Maximum delay between browse restarts
    pub max_retry: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_retry: Duration::from_millis(timing::DISCOVERY_RETRY_MS),
            max_retry: Duration::from_millis(timing::DISCOVERY_MAX_RETRY_MS),
        }
    }
}

/// Long-lived discovery activity for one transport
pub struct DiscoveryEngine {
    backend: Arc<dyn DiscoveryBackend>,
    config: DiscoveryConfig,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryEngine {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        config: DiscoveryConfig,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        Self {
            backend,
            config,
            events,
            task: None,
        }
    }

    /// Begin background listening. Calling while already running is a no-op.
    pub fn start(&mut self) {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                debug!(transport = %self.backend.transport(), "discovery already running");
                return;
            }
        }

        info!(transport = %self.backend.transport(), "starting discovery");
        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let events = self.events.clone();
        self.task = Some(tokio::spawn(browse_loop(backend, config, events)));
    }

    /// Halt listening; safe to call when not started
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(transport = %self.backend.transport(), "discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Restart browse sessions forever, deduping sightings into discovery events
async fn browse_loop(
    backend: Arc<dyn DiscoveryBackend>,
    config: DiscoveryConfig,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let transport = backend.transport();
    let mut retry = config.initial_retry;

    loop {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut seen: HashSet<Endpoint> = HashSet::new();
        let run = backend.run(raw_tx);
        tokio::pin!(run);

        let session_error = loop {
            tokio::select! {
                // Drain queued sightings before observing session end
                biased;

                sighting = raw_rx.recv() => match sighting {
                    Some(BackendEvent::Found(endpoint)) => {
                        if seen.insert(endpoint.clone()) {
                            retry = config.initial_retry;
                            debug!(%endpoint, "endpoint found");
                            if events.send(DiscoveryEvent::EndpointFound(endpoint)).is_err() {
                                return;
                            }
                        }
                    }
                    Some(BackendEvent::Lost(endpoint)) => {
                        if seen.remove(&endpoint) {
                            debug!(%endpoint, "endpoint lost");
                            if events.send(DiscoveryEvent::EndpointLost(endpoint)).is_err() {
                                return;
                            }
                        }
                    }
                    None => break None,
                },

                result = &mut run => break result.err(),
            }
        };

        if let Some(e) = session_error {
            warn!(%transport, error = %e, "discovery degraded, retrying after backoff");
            let degraded = DiscoveryEvent::Degraded {
                transport,
                reason: e.to_string(),
            };
            if events.send(degraded).is_err() {
                return;
            }
        }

        tokio::time::sleep(retry).await;
        retry = std::cmp::min(retry * 2, config.max_retry);
    }
}
