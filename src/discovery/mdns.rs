//! mDNS/DNS-SD discovery backend for network bridges
//!
//! Browses `_bridgelink._tcp.local.` and reports resolved services as
//! reachable endpoints. mDNS being unavailable (no multicast, containers,
//! captive portals) is a degraded condition handled by the engine, not a
//! fatal error.

use crate::discovery::{BackendEvent, DiscoveryBackend};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bridgelink_shared::{Endpoint, TransportKind};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Service type bridges advertise on the local network
pub const BRIDGE_SERVICE_TYPE: &str = "_bridgelink._tcp.local.";

/// mDNS browse backend
pub struct MdnsBackend {
    service_type: String,
}

impl MdnsBackend {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
        }
    }
}

impl Default for MdnsBackend {
    fn default() -> Self {
        Self::new(BRIDGE_SERVICE_TYPE)
    }
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    fn transport(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn run(&self, sightings: mpsc::UnboundedSender<BackendEvent>) -> Result<()> {
        let mdns =
            ServiceDaemon::new().map_err(|e| anyhow!("failed to start mDNS daemon: {e}"))?;
        let receiver = mdns
            .browse(&self.service_type)
            .map_err(|e| anyhow!("mDNS browse failed: {e}"))?;

        // Departure events only carry the instance name, so remember what
        // each name resolved to.
        let mut resolved: HashMap<String, Endpoint> = HashMap::new();

        let result = loop {
            match receiver.recv_async().await {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let address = match info.get_addresses().iter().next() {
                        Some(addr) => format!("{}:{}", addr, info.get_port()),
                        None => {
                            debug!(name = info.get_fullname(), "service resolved without address");
                            continue;
                        }
                    };
                    let endpoint = Endpoint::network(address);
                    resolved.insert(info.get_fullname().to_owned(), endpoint.clone());
                    if sightings.send(BackendEvent::Found(endpoint)).is_err() {
                        break Ok(());
                    }
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    if let Some(endpoint) = resolved.remove(&fullname) {
                        if sightings.send(BackendEvent::Lost(endpoint)).is_err() {
                            break Ok(());
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => break Err(anyhow!("mDNS browse channel closed: {e}")),
            }
        };

        let _ = mdns.shutdown();
        result
    }
}
