//! BasicStation wire dialect.
//!
//! Text frames carry JSON objects discriminated by `msgtype`. This module
//! owns the (de)serialisable message structs, PHYPayload reassembly from
//! the field-split uplink forms, and the translation between wire messages
//! and the upstream event types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{
    DownlinkFrame, DownlinkTiming, DownlinkTxAck, Modulation, UplinkFrame, UplinkRxInfo,
    UplinkTxInfo,
};
use crate::lorawan::Eui64;
use crate::region::{Band, DataRate};

use super::BackendError;

/// Known `msgtype` discriminator values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Version,
    RouterConfig,
    Jreq,
    Updf,
    Propdf,
    Dntxed,
    Dnmsg,
    Timesync,
}

impl MessageType {
    pub fn from_wire(s: &str) -> Option<MessageType> {
        match s {
            "version" => Some(MessageType::Version),
            "router_config" => Some(MessageType::RouterConfig),
            "jreq" => Some(MessageType::Jreq),
            "updf" => Some(MessageType::Updf),
            "propdf" => Some(MessageType::Propdf),
            "dntxed" => Some(MessageType::Dntxed),
            "dnmsg" => Some(MessageType::Dnmsg),
            "timesync" => Some(MessageType::Timesync),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct Discriminator {
    msgtype: String,
}

/// Read the `msgtype` discriminator without decoding the full message.
/// Returns the raw string; unknown values are routed as raw events by the
/// dispatcher.
pub fn message_type(payload: &str) -> Result<String, serde_json::Error> {
    let d: Discriminator = serde_json::from_str(payload)?;
    Ok(d.msgtype)
}

/// Station identification, sent once after connect.
#[derive(Debug, Clone, Deserialize)]
pub struct Version {
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub features: Option<String>,
}

/// Receive metadata attached to every uplink message.
#[derive(Debug, Clone, Deserialize)]
pub struct UpInfo {
    #[serde(default)]
    pub rctx: i64,
    #[serde(default)]
    pub xtime: i64,
    /// Microseconds since the GPS epoch; zero when the gateway has no fix.
    #[serde(default)]
    pub gpstime: i64,
    pub rssi: f32,
    pub snr: f32,
}

/// Radio metadata shared by all uplink message kinds.
#[derive(Debug, Clone, Deserialize)]
pub struct RadioMetaData {
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub frequency: u32,
    pub upinfo: UpInfo,
}

/// `updf`: a confirmed/unconfirmed data uplink, fields split out of the
/// PHYPayload by the station.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkDataFrame {
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "DevAddr")]
    pub dev_addr: i32,
    #[serde(rename = "FCtrl")]
    pub f_ctrl: u8,
    #[serde(rename = "FCnt")]
    pub f_cnt: u16,
    #[serde(rename = "FOpts", default)]
    pub f_opts: String,
    /// -1 when the frame carries no FPort.
    #[serde(rename = "FPort", default = "minus_one")]
    pub f_port: i32,
    #[serde(rename = "FRMPayload", default)]
    pub frm_payload: String,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "RefTime", default)]
    pub ref_time: f64,
    #[serde(flatten)]
    pub radio: RadioMetaData,
}

fn minus_one() -> i32 {
    -1
}

/// `jreq`: an OTAA join-request.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "MHdr")]
    pub mhdr: u8,
    #[serde(rename = "JoinEui")]
    pub join_eui: Eui64,
    #[serde(rename = "DevEui")]
    pub dev_eui: Eui64,
    #[serde(rename = "DevNonce")]
    pub dev_nonce: u16,
    #[serde(rename = "MIC")]
    pub mic: i32,
    #[serde(rename = "RefTime", default)]
    pub ref_time: f64,
    #[serde(flatten)]
    pub radio: RadioMetaData,
}

/// `propdf`: a proprietary frame forwarded verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkProprietaryFrame {
    #[serde(rename = "FRMPayload")]
    pub frm_payload: String,
    #[serde(rename = "RefTime", default)]
    pub ref_time: f64,
    #[serde(flatten)]
    pub radio: RadioMetaData,
}

/// `dntxed`: the station transmitted a previously sent downlink.
#[derive(Debug, Clone, Deserialize)]
pub struct DownlinkTransmitted {
    pub diid: i64,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: Option<Eui64>,
    #[serde(default)]
    pub rctx: i64,
    #[serde(default)]
    pub xtime: i64,
    #[serde(default)]
    pub txtime: f64,
    #[serde(default)]
    pub gpstime: i64,
}

/// `timesync` query from the station.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeSyncRequest {
    pub txtime: i64,
}

/// `timesync` reply: echoes the station's transmit time and reports the
/// current GPS time in microseconds since the GPS epoch.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSyncResponse {
    pub msgtype: MessageType,
    pub txtime: i64,
    pub gpstime: i64,
}

/// Discovery request read on `/router-info`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterInfoRequest {
    pub router: Eui64,
}

/// Discovery response; `uri` points the station at its gateway endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterInfoResponse {
    pub router: Eui64,
    pub muxs: Eui64,
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// `dnmsg`: a downlink queued for transmission by the station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownlinkMessage {
    pub msgtype: MessageType,
    #[serde(rename = "DevEui")]
    pub dev_eui: String,
    /// Device class of the transmission: 0 = A, 1 = B, 2 = C.
    #[serde(rename = "dC")]
    pub device_class: u8,
    pub diid: i64,
    pub pdu: String,
    pub priority: u8,
    #[serde(rename = "RxDelay", skip_serializing_if = "Option::is_none")]
    pub rx_delay: Option<u8>,
    #[serde(rename = "RX1DR", skip_serializing_if = "Option::is_none")]
    pub rx1_dr: Option<u8>,
    #[serde(rename = "RX1Freq", skip_serializing_if = "Option::is_none")]
    pub rx1_freq: Option<u32>,
    #[serde(rename = "RX2DR", skip_serializing_if = "Option::is_none")]
    pub rx2_dr: Option<u8>,
    #[serde(rename = "RX2Freq", skip_serializing_if = "Option::is_none")]
    pub rx2_freq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rctx: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpstime: Option<i64>,
}

fn modulation_for(band: &Band, dr_index: u8) -> Result<Modulation, BackendError> {
    let entry = band.data_rate(dr_index)?;
    Ok(match entry.data_rate {
        DataRate::Lora {
            spreading_factor,
            bandwidth,
        } => Modulation::Lora {
            bandwidth,
            spreading_factor,
            code_rate: "4/5".to_string(),
            polarization_inversion: false,
        },
        DataRate::Fsk { bit_rate } => Modulation::Fsk { datarate: bit_rate },
    })
}

fn rx_info_from_upinfo(gateway_id: Eui64, uplink_id: Uuid, upinfo: &UpInfo) -> UplinkRxInfo {
    let gps_time = if upinfo.gpstime > 0 {
        Some(std::time::Duration::from_micros(upinfo.gpstime as u64))
    } else {
        None
    };
    UplinkRxInfo {
        gateway_id,
        uplink_id,
        time_since_gps_epoch: gps_time,
        rssi: upinfo.rssi as i32,
        snr: upinfo.snr,
        context: upinfo.xtime.to_be_bytes().to_vec(),
    }
}

fn decode_hex_field(field: &'static str, value: &str) -> Result<Vec<u8>, BackendError> {
    hex::decode(value).map_err(|_| BackendError::InvalidHexField(field))
}

/// Translate an `updf` message, reassembling the PHYPayload from its split
/// fields (DevAddr, FCnt and MIC are little-endian on the LoRaWAN wire).
pub fn uplink_frame_from_updf(
    band: &Band,
    gateway_id: Eui64,
    uplink_id: Uuid,
    pl: &UplinkDataFrame,
) -> Result<UplinkFrame, BackendError> {
    let f_opts = decode_hex_field("FOpts", &pl.f_opts)?;
    let frm_payload = decode_hex_field("FRMPayload", &pl.frm_payload)?;

    let mut phy = Vec::with_capacity(12 + f_opts.len() + frm_payload.len());
    phy.push(pl.mhdr);
    phy.extend_from_slice(&(pl.dev_addr as u32).to_le_bytes());
    phy.push(pl.f_ctrl);
    phy.extend_from_slice(&pl.f_cnt.to_le_bytes());
    phy.extend_from_slice(&f_opts);
    if pl.f_port >= 0 {
        phy.push(pl.f_port as u8);
    }
    phy.extend_from_slice(&frm_payload);
    phy.extend_from_slice(&(pl.mic as u32).to_le_bytes());

    Ok(UplinkFrame {
        phy_payload: phy,
        tx_info: UplinkTxInfo {
            frequency: pl.radio.frequency,
            modulation: modulation_for(band, pl.radio.dr)?,
        },
        rx_info: rx_info_from_upinfo(gateway_id, uplink_id, &pl.radio.upinfo),
    })
}

/// Translate a `jreq` message. Join-request EUIs are little-endian in the
/// PHYPayload.
pub fn uplink_frame_from_jreq(
    band: &Band,
    gateway_id: Eui64,
    uplink_id: Uuid,
    pl: &JoinRequest,
) -> Result<UplinkFrame, BackendError> {
    let mut phy = Vec::with_capacity(23);
    phy.push(pl.mhdr);
    let mut join_eui = *pl.join_eui.as_bytes();
    join_eui.reverse();
    phy.extend_from_slice(&join_eui);
    let mut dev_eui = *pl.dev_eui.as_bytes();
    dev_eui.reverse();
    phy.extend_from_slice(&dev_eui);
    phy.extend_from_slice(&pl.dev_nonce.to_le_bytes());
    phy.extend_from_slice(&(pl.mic as u32).to_le_bytes());

    Ok(UplinkFrame {
        phy_payload: phy,
        tx_info: UplinkTxInfo {
            frequency: pl.radio.frequency,
            modulation: modulation_for(band, pl.radio.dr)?,
        },
        rx_info: rx_info_from_upinfo(gateway_id, uplink_id, &pl.radio.upinfo),
    })
}

/// Translate a `propdf` message; the payload is forwarded verbatim.
pub fn uplink_frame_from_propdf(
    band: &Band,
    gateway_id: Eui64,
    uplink_id: Uuid,
    pl: &UplinkProprietaryFrame,
) -> Result<UplinkFrame, BackendError> {
    Ok(UplinkFrame {
        phy_payload: decode_hex_field("FRMPayload", &pl.frm_payload)?,
        tx_info: UplinkTxInfo {
            frequency: pl.radio.frequency,
            modulation: modulation_for(band, pl.radio.dr)?,
        },
        rx_info: rx_info_from_upinfo(gateway_id, uplink_id, &pl.radio.upinfo),
    })
}

/// Translate a `dntxed` ack. The downlink id is attached later from the
/// token cache; a missing mapping is not fatal.
pub fn downlink_txack_from_dntxed(gateway_id: Eui64, pl: &DownlinkTransmitted) -> DownlinkTxAck {
    DownlinkTxAck {
        gateway_id,
        token: pl.diid as u32,
        downlink_id: None,
    }
}

fn data_rate_of(modulation: &Modulation) -> DataRate {
    match modulation {
        Modulation::Lora {
            bandwidth,
            spreading_factor,
            ..
        } => DataRate::Lora {
            spreading_factor: *spreading_factor,
            bandwidth: *bandwidth,
        },
        Modulation::Fsk { datarate } => DataRate::Fsk { bit_rate: *datarate },
    }
}

/// Encode a downlink frame as a `dnmsg`. The device class and window
/// parameters derive from the frame's timing info.
pub fn downlink_message_from_frame(
    band: &Band,
    df: &DownlinkFrame,
) -> Result<DownlinkMessage, BackendError> {
    let dr_index = band.data_rate_index(&data_rate_of(&df.tx_info.modulation))?;

    let mut msg = DownlinkMessage {
        msgtype: MessageType::Dnmsg,
        dev_eui: Eui64::default().to_dashed(),
        device_class: 0,
        diid: df.token as i64,
        pdu: hex::encode(&df.phy_payload),
        priority: 1,
        rx_delay: None,
        rx1_dr: None,
        rx1_freq: None,
        rx2_dr: None,
        rx2_freq: None,
        xtime: None,
        rctx: None,
        gpstime: None,
    };

    match &df.tx_info.timing {
        DownlinkTiming::Delay { delay } => {
            let context: [u8; 8] = df
                .tx_info
                .context
                .as_slice()
                .try_into()
                .map_err(|_| BackendError::InvalidDownlinkContext)?;
            msg.device_class = 0;
            msg.rx_delay = Some(delay.as_secs().max(1) as u8);
            msg.rx1_dr = Some(dr_index);
            msg.rx1_freq = Some(df.tx_info.frequency);
            msg.xtime = Some(i64::from_be_bytes(context));
        }
        DownlinkTiming::GpsEpoch {
            time_since_gps_epoch,
        } => {
            msg.device_class = 1;
            msg.rx2_dr = Some(dr_index);
            msg.rx2_freq = Some(df.tx_info.frequency);
            msg.gpstime = Some(time_since_gps_epoch.as_micros() as i64);
        }
        DownlinkTiming::Immediately => {
            msg.device_class = 2;
            msg.rx2_dr = Some(dr_index);
            msg.rx2_freq = Some(df.tx_info.frequency);
        }
    }

    Ok(msg)
}
