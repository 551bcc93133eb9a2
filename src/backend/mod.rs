//! Upstream-facing event and command types.
//!
//! The backend demultiplexes gateway traffic into these typed events and
//! delivers them through registered callback slots; the upstream integration
//! injects downlinks and raw commands through the matching command types.
//! Shapes follow the ChirpStack gateway message schema.

pub mod basicstation;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lorawan::Eui64;

/// Modulation parameters of a radio transmission.
#[derive(Debug, Clone, PartialEq)]
pub enum Modulation {
    Lora {
        /// Bandwidth in Hz.
        bandwidth: u32,
        spreading_factor: u8,
        code_rate: String,
        polarization_inversion: bool,
    },
    Fsk {
        /// Bit rate in bits per second.
        datarate: u32,
    },
}

/// Radio parameters of a received uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkTxInfo {
    /// Frequency in Hz.
    pub frequency: u32,
    pub modulation: Modulation,
}

/// Receive metadata of an uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkRxInfo {
    pub gateway_id: Eui64,
    /// Fresh UUID assigned by the bridge for upstream correlation.
    pub uplink_id: Uuid,
    /// GPS time reported by the gateway, when it has a GPS fix.
    pub time_since_gps_epoch: Option<Duration>,
    pub rssi: i32,
    pub snr: f32,
    /// Opaque gateway context (concentrator timestamp); echoed back on
    /// downlinks so the gateway can schedule the transmission.
    pub context: Vec<u8>,
}

/// A received LoRaWAN frame, PHYPayload plus radio metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkFrame {
    pub phy_payload: Vec<u8>,
    pub tx_info: UplinkTxInfo,
    pub rx_info: UplinkRxInfo,
}

/// Downlink transmission timing.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkTiming {
    /// Transmit `delay` after the uplink referenced by `context` (class A).
    Delay { delay: Duration },
    /// Transmit at the given GPS time (class B).
    GpsEpoch { time_since_gps_epoch: Duration },
    /// Transmit as soon as possible (class C).
    Immediately,
}

/// Radio parameters for a downlink transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkTxInfo {
    /// Frequency in Hz.
    pub frequency: u32,
    /// TX power in dBm.
    pub power: i32,
    pub modulation: Modulation,
    pub timing: DownlinkTiming,
    /// Gateway context of the uplink this downlink answers (class A).
    pub context: Vec<u8>,
}

/// A downlink frame to be transmitted by a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    pub gateway_id: Eui64,
    pub downlink_id: Uuid,
    /// 16-bit correlation token; allocated by the backend when zero.
    pub token: u32,
    pub phy_payload: Vec<u8>,
    pub tx_info: DownlinkTxInfo,
}

/// Acknowledgement that a gateway transmitted (or failed to transmit) a
/// downlink.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkTxAck {
    pub gateway_id: Eui64,
    pub token: u32,
    /// Original downlink id, recovered from the token cache when the ack
    /// arrives within the cache TTL.
    pub downlink_id: Option<Uuid>,
}

/// Periodic per-gateway statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayStats {
    pub gateway_id: Eui64,
    pub time: DateTime<Utc>,
    pub stats_id: Uuid,
    pub rx_packets_received: u32,
    pub rx_packets_received_ok: u32,
    pub tx_packets_received: u32,
    pub tx_packets_emitted: u32,
}

/// Opaque payload received from a packet forwarder (binary frames and
/// unrecognised message types).
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacketForwarderEvent {
    pub gateway_id: Eui64,
    pub raw_id: Uuid,
    pub payload: Vec<u8>,
}

/// Opaque payload to pass through to a packet forwarder unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacketForwarderCommand {
    pub gateway_id: Eui64,
    pub raw_id: Uuid,
    pub payload: Vec<u8>,
}

/// Emitted when a gateway appears in or disappears from the registry, so
/// the upstream can manage per-gateway subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribe {
    pub subscribe: bool,
    pub gateway_id: Eui64,
}

pub type UplinkFrameCallback = Arc<dyn Fn(UplinkFrame) + Send + Sync>;
pub type DownlinkTxAckCallback = Arc<dyn Fn(DownlinkTxAck) + Send + Sync>;
pub type GatewayStatsCallback = Arc<dyn Fn(GatewayStats) + Send + Sync>;
pub type RawPacketForwarderEventCallback = Arc<dyn Fn(RawPacketForwarderEvent) + Send + Sync>;
pub type SubscribeCallback = Arc<dyn Fn(Subscribe) + Send + Sync>;
