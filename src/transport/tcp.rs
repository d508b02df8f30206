//! TCP transport implementation for network bridge connections

use crate::transport::traits::{BridgeSession, TransportConnector};
use anyhow::Result;
use async_trait::async_trait;
use bridgelink_shared::{Endpoint, FailureReason, TransportKind};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Map a dial/read error onto the failure taxonomy
fn classify_io_error(e: &io::Error) -> FailureReason {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => FailureReason::Refused,
        io::ErrorKind::TimedOut => FailureReason::Timeout,
        io::ErrorKind::InvalidInput => FailureReason::ProtocolError(e.to_string()),
        _ => FailureReason::TransportUnavailable(e.to_string()),
    }
}

/// TCP session wrapping a connected stream
pub struct TcpSession {
    stream: TcpStream,
}

#[async_trait]
impl BridgeSession for TcpSession {
    async fn wait_closed(&mut self) -> String {
        // The device protocol layer owns the payload; here incoming bytes are
        // drained only to observe EOF or a transport error.
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) => return "bridge closed connection".into(),
                Ok(_) => {}
                Err(e) => return format!("read error: {}", e),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// TCP connector dialing a `host:port` endpoint address
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn name(&self) -> &'static str {
        "Network"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BridgeSession>, FailureReason> {
        let stream = TcpStream::connect(endpoint.address.as_str())
            .await
            .map_err(|e| classify_io_error(&e))?;
        Ok(Box::new(TcpSession { stream }))
    }
}
