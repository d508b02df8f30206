//! Transport trait abstraction for pluggable bridge connections

use anyhow::Result;
use async_trait::async_trait;
use bridgelink_shared::{Endpoint, FailureReason, TransportKind};

/// A live link to a bridge over one transport.
///
/// The device wire protocol runs elsewhere; the connectivity core only needs
/// liveness and teardown.
#[async_trait]
pub trait BridgeSession: Send + 'static {
    /// Resolves when the link drops, with a human-readable reason
    async fn wait_closed(&mut self) -> String;

    /// Close the link gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Factory for establishing bridge connections over one transport
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// Which transport this connector dials
    fn kind(&self) -> TransportKind;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;

    /// Attempt to connect, returning a live session on success
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BridgeSession>, FailureReason>;
}
