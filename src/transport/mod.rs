pub mod ble;
pub mod tcp;
pub mod traits;

pub use ble::BleConnector;
pub use tcp::TcpConnector;
pub use traits::{BridgeSession, TransportConnector};
