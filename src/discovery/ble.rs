//! BLE advertisement scanning for bridge peripherals

use crate::discovery::{BackendEvent, DiscoveryBackend};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::{AdapterEvent, Device};
use bridgelink_shared::{Endpoint, TransportKind};
use futures::StreamExt;
use tokio::sync::mpsc;

/// Configuration for BLE scanning
#[derive(Debug, Clone)]
pub struct BleScanConfig {
    /// Advertised name prefix identifying bridge peripherals; `None` accepts
    /// every device
    pub name_prefix: Option<String>,
}

impl Default for BleScanConfig {
    fn default() -> Self {
        Self {
            name_prefix: Some("Bridge".into()),
        }
    }
}

/// BLE scan backend over BlueZ
pub struct BleBackend {
    config: BleScanConfig,
}

impl BleBackend {
    pub fn new(config: BleScanConfig) -> Self {
        Self { config }
    }

    /// Check if a device is a bridge (by advertised name prefix)
    async fn is_bridge_device(&self, device: &Device) -> bool {
        let prefix = match &self.config.name_prefix {
            Some(prefix) => prefix,
            None => return true,
        };
        if let Ok(Some(name)) = device.name().await {
            if name.starts_with(prefix.as_str()) {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl DiscoveryBackend for BleBackend {
    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn run(&self, sightings: mpsc::UnboundedSender<BackendEvent>) -> Result<()> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        while let Some(event) = discover.next().await {
            match event {
                AdapterEvent::DeviceAdded(addr) => {
                    if let Ok(device) = adapter.device(addr) {
                        if self.is_bridge_device(&device).await
                            && sightings
                                .send(BackendEvent::Found(Endpoint::ble(addr.to_string())))
                                .is_err()
                        {
                            return Ok(());
                        }
                    }
                }
                AdapterEvent::DeviceRemoved(addr) => {
                    // The engine's seen-set filters removals of devices that
                    // never matched the prefix.
                    if sightings
                        .send(BackendEvent::Lost(Endpoint::ble(addr.to_string())))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        Err(anyhow!("bluetooth discovery stream ended"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BleScanConfig::default();
        assert_eq!(config.name_prefix, Some("Bridge".into()));
    }
}
