//! lorabridge library
//!
//! Upstream-facing side of a LoRaWAN packet-forwarder bridge: a
//! BasicStation WebSocket backend that turns gateway traffic into a typed
//! event stream and routes downlink commands back onto the right socket.

pub mod backend;
pub mod config;
pub mod logging;
pub mod lorawan;
pub mod region;
pub mod tls;
