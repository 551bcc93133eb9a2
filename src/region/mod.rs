//! Band tables for the supported LoRaWAN regions.
//!
//! This is the frequency-plan facade consumed by the BasicStation backend:
//! it maps data-rate indexes to modulation parameters (and back) and knows
//! the region naming used by the BasicStation `router_config` schema.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegionError {
    #[error("unknown region '{0}'")]
    UnknownRegion(String),

    #[error("data-rate index {0} is not defined for this region")]
    UndefinedDataRate(u8),

    #[error("no data-rate index matches the given modulation parameters")]
    UnknownDataRate,
}

/// LoRaWAN region. Fixed per process; selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    EU868,
    US915,
    AU915,
    AS923,
    IN865,
    KR920,
    RU864,
}

impl Region {
    /// Region name in the BasicStation `router_config` dialect, which names
    /// plans after their lowest frequency.
    pub fn basicstation_name(&self) -> &'static str {
        match self {
            Region::EU868 => "EU863",
            Region::US915 => "US902",
            Region::AU915 => "AU915",
            Region::AS923 => "AS923",
            Region::IN865 => "IN865",
            Region::KR920 => "KR920",
            Region::RU864 => "RU864",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::EU868 => "EU868",
            Region::US915 => "US915",
            Region::AU915 => "AU915",
            Region::AS923 => "AS923",
            Region::IN865 => "IN865",
            Region::KR920 => "KR920",
            Region::RU864 => "RU864",
        };
        f.write_str(name)
    }
}

impl FromStr for Region {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EU868" | "EU_863_870" => Ok(Region::EU868),
            "US915" | "US_902_928" => Ok(Region::US915),
            "AU915" | "AU_915_928" => Ok(Region::AU915),
            "AS923" | "AS_923" => Ok(Region::AS923),
            "IN865" | "IN_865_867" => Ok(Region::IN865),
            "KR920" | "KR_920_923" => Ok(Region::KR920),
            "RU864" | "RU_864_870" => Ok(Region::RU864),
            other => Err(RegionError::UnknownRegion(other.to_string())),
        }
    }
}

/// Modulation parameters behind a data-rate index. Bandwidth in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Lora { spreading_factor: u8, bandwidth: u32 },
    Fsk { bit_rate: u32 },
}

/// One slot of the region's data-rate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRateEntry {
    pub data_rate: DataRate,
    /// True when the index is valid for downlink only (US915/AU915 RX
    /// windows).
    pub downlink_only: bool,
}

const fn lora(sf: u8, bw: u32) -> Option<DataRateEntry> {
    Some(DataRateEntry {
        data_rate: DataRate::Lora {
            spreading_factor: sf,
            bandwidth: bw,
        },
        downlink_only: false,
    })
}

const fn lora_dn(sf: u8, bw: u32) -> Option<DataRateEntry> {
    Some(DataRateEntry {
        data_rate: DataRate::Lora {
            spreading_factor: sf,
            bandwidth: bw,
        },
        downlink_only: true,
    })
}

const fn fsk(bit_rate: u32) -> Option<DataRateEntry> {
    Some(DataRateEntry {
        data_rate: DataRate::Fsk { bit_rate },
        downlink_only: false,
    })
}

/// The data-rate table of one region; 16 slots per the regional-parameters
/// encoding space.
#[derive(Debug, Clone)]
pub struct Band {
    region: Region,
    data_rates: [Option<DataRateEntry>; 16],
}

impl Band {
    pub fn for_region(region: Region) -> Band {
        let mut data_rates: [Option<DataRateEntry>; 16] = [None; 16];

        match region {
            Region::EU868 | Region::RU864 => {
                data_rates[0] = lora(12, 125_000);
                data_rates[1] = lora(11, 125_000);
                data_rates[2] = lora(10, 125_000);
                data_rates[3] = lora(9, 125_000);
                data_rates[4] = lora(8, 125_000);
                data_rates[5] = lora(7, 125_000);
                data_rates[6] = lora(7, 250_000);
                data_rates[7] = fsk(50_000);
            }
            Region::AS923 | Region::IN865 => {
                data_rates[0] = lora(12, 125_000);
                data_rates[1] = lora(11, 125_000);
                data_rates[2] = lora(10, 125_000);
                data_rates[3] = lora(9, 125_000);
                data_rates[4] = lora(8, 125_000);
                data_rates[5] = lora(7, 125_000);
                data_rates[6] = lora(7, 250_000);
                data_rates[7] = fsk(50_000);
            }
            Region::KR920 => {
                data_rates[0] = lora(12, 125_000);
                data_rates[1] = lora(11, 125_000);
                data_rates[2] = lora(10, 125_000);
                data_rates[3] = lora(9, 125_000);
                data_rates[4] = lora(8, 125_000);
                data_rates[5] = lora(7, 125_000);
            }
            Region::US915 => {
                data_rates[0] = lora(10, 125_000);
                data_rates[1] = lora(9, 125_000);
                data_rates[2] = lora(8, 125_000);
                data_rates[3] = lora(7, 125_000);
                data_rates[4] = lora(8, 500_000);
                data_rates[8] = lora_dn(12, 500_000);
                data_rates[9] = lora_dn(11, 500_000);
                data_rates[10] = lora_dn(10, 500_000);
                data_rates[11] = lora_dn(9, 500_000);
                data_rates[12] = lora_dn(8, 500_000);
                data_rates[13] = lora_dn(7, 500_000);
            }
            Region::AU915 => {
                data_rates[0] = lora(12, 125_000);
                data_rates[1] = lora(11, 125_000);
                data_rates[2] = lora(10, 125_000);
                data_rates[3] = lora(9, 125_000);
                data_rates[4] = lora(8, 125_000);
                data_rates[5] = lora(7, 125_000);
                data_rates[6] = lora(8, 500_000);
                data_rates[8] = lora_dn(12, 500_000);
                data_rates[9] = lora_dn(11, 500_000);
                data_rates[10] = lora_dn(10, 500_000);
                data_rates[11] = lora_dn(9, 500_000);
                data_rates[12] = lora_dn(8, 500_000);
                data_rates[13] = lora_dn(7, 500_000);
            }
        }

        Band { region, data_rates }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Modulation parameters for a data-rate index.
    pub fn data_rate(&self, index: u8) -> Result<DataRateEntry, RegionError> {
        self.data_rates
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or(RegionError::UndefinedDataRate(index))
    }

    /// Reverse lookup: data-rate index for the given modulation parameters.
    /// Uplink entries win over downlink-only ones so shared SF/BW pairs
    /// resolve to their canonical uplink index.
    pub fn data_rate_index(&self, dr: &DataRate) -> Result<u8, RegionError> {
        let matches = |e: &DataRateEntry| e.data_rate == *dr;

        if let Some(i) = self
            .data_rates
            .iter()
            .position(|e| e.map(|e| matches(&e) && !e.downlink_only).unwrap_or(false))
        {
            return Ok(i as u8);
        }
        self.data_rates
            .iter()
            .position(|e| e.map(|e| matches(&e)).unwrap_or(false))
            .map(|i| i as u8)
            .ok_or(RegionError::UnknownDataRate)
    }

    /// The 16-slot table in the shape the `router_config` `DRs` field wants:
    /// `[spreading-factor, bandwidth-kHz, downlink-only]`, with `-1` marking
    /// undefined slots and FSK slots zeroed.
    pub fn router_config_drs(&self) -> Vec<[i32; 3]> {
        self.data_rates
            .iter()
            .map(|slot| match slot {
                Some(DataRateEntry {
                    data_rate: DataRate::Lora {
                        spreading_factor,
                        bandwidth,
                    },
                    downlink_only,
                }) => [
                    *spreading_factor as i32,
                    (*bandwidth / 1000) as i32,
                    *downlink_only as i32,
                ],
                Some(DataRateEntry {
                    data_rate: DataRate::Fsk { .. },
                    ..
                }) => [0, 0, 0],
                None => [-1, 0, 0],
            })
            .collect()
    }
}
