//! BLE transport implementation over BlueZ

use crate::transport::traits::{BridgeSession, TransportConnector};
use anyhow::Result;
use async_trait::async_trait;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty};
use bridgelink_shared::{Endpoint, FailureReason, TransportKind};
use futures::StreamExt;

/// Map a BlueZ error onto the failure taxonomy
fn classify_bluer_error(e: &bluer::Error) -> FailureReason {
    match e.kind {
        bluer::ErrorKind::ConnectionAttemptFailed => FailureReason::Refused,
        bluer::ErrorKind::NotReady | bluer::ErrorKind::NotAvailable => {
            FailureReason::TransportUnavailable(e.to_string())
        }
        _ => FailureReason::ProtocolError(e.to_string()),
    }
}

/// Get the default powered Bluetooth adapter
async fn get_adapter() -> bluer::Result<Adapter> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    Ok(adapter)
}

/// BLE session holding a connected peripheral handle
pub struct BleSession {
    device: Device,
}

#[async_trait]
impl BridgeSession for BleSession {
    async fn wait_closed(&mut self) -> String {
        let mut events = match self.device.events().await {
            Ok(events) => events,
            Err(e) => return format!("device event stream unavailable: {}", e),
        };
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                return "peripheral disconnected".into();
            }
        }
        "device event stream ended".into()
    }

    async fn close(&mut self) -> Result<()> {
        self.device.disconnect().await?;
        Ok(())
    }
}

/// BLE connector dialing a peripheral by MAC address
pub struct BleConnector;

impl BleConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BleConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for BleConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn name(&self) -> &'static str {
        "BLE"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BridgeSession>, FailureReason> {
        let addr: Address = endpoint
            .address
            .parse()
            .map_err(|_| FailureReason::ProtocolError(format!(
                "invalid BLE address: {}",
                endpoint.address
            )))?;

        let adapter = get_adapter()
            .await
            .map_err(|e| FailureReason::TransportUnavailable(e.to_string()))?;

        let device = adapter
            .device(addr)
            .map_err(|e| FailureReason::TransportUnavailable(e.to_string()))?;

        if !device.is_connected().await.unwrap_or(false) {
            device.connect().await.map_err(|e| classify_bluer_error(&e))?;
        }

        Ok(Box::new(BleSession { device }))
    }
}
