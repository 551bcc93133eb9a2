//! Router-config builder.
//!
//! Precomputes the one-shot `router_config` message a station receives in
//! reply to its `version` message: region parameters, NetID / JoinEUI
//! filters, the frequency range and one SX1301 configuration block per
//! concentrator board. Built once in the backend constructor and reused
//! for every connection.

use serde::{Deserialize, Serialize};

use crate::config::Concentrator;
use crate::lorawan::{Eui64, NetId};
use crate::region::Band;

use super::messages::MessageType;
use super::BackendError;

/// Channels per SX1301 multi-SF modem.
const MULTI_SF_CHANNELS: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sx1301RadioConf {
    pub enable: bool,
    pub freq: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sx1301ChanConf {
    pub enable: bool,
    pub radio: u8,
    #[serde(rename = "if")]
    pub if_freq: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sx1301ChanLoraStdConf {
    pub enable: bool,
    pub radio: u8,
    #[serde(rename = "if")]
    pub if_freq: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_factor: Option<u32>,
}

/// One SX1301 concentrator block of the router-config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sx1301Conf {
    pub radio_0: Sx1301RadioConf,
    pub radio_1: Sx1301RadioConf,
    #[serde(rename = "chan_FSK")]
    pub chan_fsk: Sx1301ChanConf,
    #[serde(rename = "chan_Lora_std")]
    pub chan_lora_std: Sx1301ChanLoraStdConf,
    #[serde(rename = "chan_multiSF_0")]
    pub chan_multi_sf_0: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_1")]
    pub chan_multi_sf_1: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_2")]
    pub chan_multi_sf_2: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_3")]
    pub chan_multi_sf_3: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_4")]
    pub chan_multi_sf_4: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_5")]
    pub chan_multi_sf_5: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_6")]
    pub chan_multi_sf_6: Sx1301ChanConf,
    #[serde(rename = "chan_multiSF_7")]
    pub chan_multi_sf_7: Sx1301ChanConf,
}

impl Sx1301Conf {
    fn multi_sf_mut(&mut self, index: usize) -> &mut Sx1301ChanConf {
        match index {
            0 => &mut self.chan_multi_sf_0,
            1 => &mut self.chan_multi_sf_1,
            2 => &mut self.chan_multi_sf_2,
            3 => &mut self.chan_multi_sf_3,
            4 => &mut self.chan_multi_sf_4,
            5 => &mut self.chan_multi_sf_5,
            6 => &mut self.chan_multi_sf_6,
            _ => &mut self.chan_multi_sf_7,
        }
    }
}

/// The full `router_config` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub msgtype: MessageType,
    #[serde(rename = "NetID", skip_serializing_if = "Option::is_none")]
    pub net_id: Option<Vec<u32>>,
    #[serde(rename = "JoinEui", skip_serializing_if = "Option::is_none")]
    pub join_eui: Option<Vec<[u64; 2]>>,
    pub region: String,
    pub hwspec: String,
    pub freq_range: [u32; 2],
    #[serde(rename = "DRs")]
    pub drs: Vec<[i32; 3]>,
    pub sx1301_conf: Vec<Sx1301Conf>,
    pub nocca: bool,
    pub nodc: bool,
    pub nodwell: bool,
}

/// Build the router-config for the configured region and concentrator plan.
pub fn build(
    band: &Band,
    net_ids: &[NetId],
    join_euis: &[[Eui64; 2]],
    frequency_min: u32,
    frequency_max: u32,
    concentrators: &[Concentrator],
) -> Result<RouterConfig, BackendError> {
    if concentrators.is_empty() {
        return Err(BackendError::NoConcentrators);
    }

    let net_id = if net_ids.is_empty() {
        None
    } else {
        Some(net_ids.iter().map(|n| n.to_u32()).collect())
    };

    let join_eui = if join_euis.is_empty() {
        None
    } else {
        Some(
            join_euis
                .iter()
                .map(|pair| [pair[0].to_u64(), pair[1].to_u64()])
                .collect(),
        )
    };

    let mut sx1301_conf = Vec::with_capacity(concentrators.len());
    for c in concentrators {
        sx1301_conf.push(sx1301_conf_for(c)?);
    }

    Ok(RouterConfig {
        msgtype: MessageType::RouterConfig,
        net_id,
        join_eui,
        region: band.region().basicstation_name().to_string(),
        hwspec: format!("sx1301/{}", concentrators.len()),
        freq_range: [frequency_min, frequency_max],
        drs: band.router_config_drs(),
        sx1301_conf,
        nocca: true,
        nodc: true,
        nodwell: true,
    })
}

/// Derive one SX1301 block from a concentrator plan. The lower half of the
/// multi-SF channels (plus the LoRa-STD channel) sits on radio 0, the upper
/// half (plus FSK) on radio 1; each radio is centred on its channel span so
/// every IF offset stays within the modem's passband.
fn sx1301_conf_for(c: &Concentrator) -> Result<Sx1301Conf, BackendError> {
    let mut frequencies = c.multi_sf.frequencies.clone();
    if frequencies.len() > MULTI_SF_CHANNELS {
        return Err(BackendError::TooManyChannels(frequencies.len()));
    }
    frequencies.sort_unstable();

    let split = frequencies.len().div_ceil(2);
    let (radio_0_chans, radio_1_chans) = frequencies.split_at(split);

    let mut radio_0_span: Vec<u32> = radio_0_chans.to_vec();
    if c.lora_std.frequency > 0 {
        radio_0_span.push(c.lora_std.frequency);
    }
    let mut radio_1_span: Vec<u32> = radio_1_chans.to_vec();
    if c.fsk.frequency > 0 {
        radio_1_span.push(c.fsk.frequency);
    }

    let mut conf = Sx1301Conf::default();
    if let Some(center) = center_of(&radio_0_span) {
        conf.radio_0 = Sx1301RadioConf {
            enable: true,
            freq: center,
        };
    }
    if let Some(center) = center_of(&radio_1_span) {
        conf.radio_1 = Sx1301RadioConf {
            enable: true,
            freq: center,
        };
    }

    for (i, freq) in frequencies.iter().enumerate() {
        let (radio, center) = if i < split {
            (0u8, conf.radio_0.freq)
        } else {
            (1u8, conf.radio_1.freq)
        };
        *conf.multi_sf_mut(i) = Sx1301ChanConf {
            enable: true,
            radio,
            if_freq: *freq as i32 - center as i32,
        };
    }

    if c.lora_std.frequency > 0 {
        conf.chan_lora_std = Sx1301ChanLoraStdConf {
            enable: true,
            radio: 0,
            if_freq: c.lora_std.frequency as i32 - conf.radio_0.freq as i32,
            bandwidth: Some(c.lora_std.bandwidth),
            spread_factor: Some(c.lora_std.spreading_factor),
        };
    }

    if c.fsk.frequency > 0 {
        conf.chan_fsk = Sx1301ChanConf {
            enable: true,
            radio: 1,
            if_freq: c.fsk.frequency as i32 - conf.radio_1.freq as i32,
        };
    }

    Ok(conf)
}

fn center_of(frequencies: &[u32]) -> Option<u32> {
    let min = frequencies.iter().min()?;
    let max = frequencies.iter().max()?;
    Some((min + max) / 2)
}
