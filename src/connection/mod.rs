//! Connection management for one transport
//!
//! This module handles:
//! - Serialized driving of the connection lifecycle (single-writer state)
//! - Connect/disconnect with bounded timeouts and cancellation
//! - Automatic discovery re-arm after failures and lost links

mod machine;

pub use machine::{ConnectionMachine, MachineConfig};
