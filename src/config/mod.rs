//! Configuration loading.
//!
//! Settings come from a TOML file plus `LORABRIDGE__`-prefixed environment
//! overrides (double underscore as the nesting separator, e.g.
//! `LORABRIDGE__BACKEND__BASIC_STATION__BIND`). Durations are humantime
//! strings (`"30s"`, `"1m5s"`). Everything is immutable after load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),

    #[error("ping_interval ({ping:?}) must be shorter than read_timeout ({read:?})")]
    PingIntervalTooLong { ping: Duration, read: Duration },

    #[error("single mode is enabled but single.gw_id is not set")]
    SingleModeWithoutGatewayId,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendSection {
    #[serde(default)]
    pub basic_station: BasicStation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicStation {
    /// Listen address; `"127.0.0.1:0"` is valid so tests can discover the
    /// assigned port.
    #[serde(default = "BasicStation::bind_default")]
    pub bind: String,

    /// CA certificate for client-certificate verification. Setting any of
    /// the three TLS inputs switches the listener to `wss`.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(default = "BasicStation::stats_interval_default", with = "humantime_serde")]
    pub stats_interval: Duration,
    #[serde(default = "BasicStation::ping_interval_default", with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(default = "BasicStation::read_timeout_default", with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(default = "BasicStation::write_timeout_default", with = "humantime_serde")]
    pub write_timeout: Duration,

    #[serde(default = "BasicStation::region_default")]
    pub region: String,
    #[serde(default = "BasicStation::frequency_min_default")]
    pub frequency_min: u32,
    #[serde(default = "BasicStation::frequency_max_default")]
    pub frequency_max: u32,

    #[serde(default)]
    pub concentrators: Vec<Concentrator>,

    #[serde(default)]
    pub single: Single,
}

impl Default for BasicStation {
    fn default() -> Self {
        BasicStation {
            bind: BasicStation::bind_default(),
            ca_cert: None,
            tls_cert: None,
            tls_key: None,
            stats_interval: BasicStation::stats_interval_default(),
            ping_interval: BasicStation::ping_interval_default(),
            read_timeout: BasicStation::read_timeout_default(),
            write_timeout: BasicStation::write_timeout_default(),
            region: BasicStation::region_default(),
            frequency_min: BasicStation::frequency_min_default(),
            frequency_max: BasicStation::frequency_max_default(),
            concentrators: Vec::new(),
            single: Single::default(),
        }
    }
}

impl BasicStation {
    fn bind_default() -> String {
        "0.0.0.0:3001".into()
    }

    fn stats_interval_default() -> Duration {
        Duration::from_secs(30)
    }

    fn ping_interval_default() -> Duration {
        Duration::from_secs(60)
    }

    fn read_timeout_default() -> Duration {
        // Slightly above the ping interval so a missed pong still counts.
        Duration::from_secs(65)
    }

    fn write_timeout_default() -> Duration {
        Duration::from_secs(1)
    }

    fn region_default() -> String {
        "EU868".into()
    }

    fn frequency_min_default() -> u32 {
        863_000_000
    }

    fn frequency_max_default() -> u32 {
        870_000_000
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Concentrator {
    #[serde(default)]
    pub multi_sf: ConcentratorMultiSf,
    #[serde(default)]
    pub lora_std: ConcentratorLoraStd,
    #[serde(default)]
    pub fsk: ConcentratorFsk,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConcentratorMultiSf {
    #[serde(default)]
    pub frequencies: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConcentratorLoraStd {
    #[serde(default)]
    pub frequency: u32,
    #[serde(default)]
    pub bandwidth: u32,
    #[serde(default)]
    pub spreading_factor: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConcentratorFsk {
    #[serde(default)]
    pub frequency: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Single {
    #[serde(default)]
    pub enabled: bool,
    /// Fixed gateway EUI as 16 hex digits.
    #[serde(default)]
    pub gw_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Filters {
    /// Hex NetIDs to include in the router-config filter.
    #[serde(default)]
    pub net_ids: Vec<String>,
    /// Inclusive JoinEUI range pairs, each as two 16-hex-digit strings.
    #[serde(default)]
    pub join_euis: Vec<[String; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Logging {
    #[serde(default = "Logging::level_default")]
    pub level: String,
    /// `"plaintext"` or `"json"`.
    #[serde(default = "Logging::format_default")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: Logging::level_default(),
            format: Logging::format_default(),
        }
    }
}

impl Logging {
    fn level_default() -> String {
        "info".into()
    }

    fn format_default() -> String {
        "plaintext".into()
    }
}

impl Settings {
    /// Load settings from the given file (when provided) and the
    /// environment, then validate cross-field constraints.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("LORABRIDGE").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bs = &self.backend.basic_station;
        if bs.ping_interval >= bs.read_timeout {
            return Err(ConfigError::PingIntervalTooLong {
                ping: bs.ping_interval,
                read: bs.read_timeout,
            });
        }
        if bs.single.enabled && bs.single.gw_id.is_empty() {
            return Err(ConfigError::SingleModeWithoutGatewayId);
        }
        Ok(())
    }
}

/// Commented configuration template for the `config` CLI subcommand.
pub fn default_template() -> &'static str {
    r#"[backend.basic_station]
# Listen address for the BasicStation web-socket server.
bind = "0.0.0.0:3001"

# TLS material. Setting any of these serves wss instead of ws; setting
# ca_cert additionally requires and verifies client certificates whose
# Common Name equals the gateway EUI.
# ca_cert = ""
# tls_cert = ""
# tls_key = ""

# Period between gateway statistics flushes.
stats_interval = "30s"

# Web-socket ping period. Must be shorter than read_timeout.
ping_interval = "1m"

# Per-frame read and write deadlines.
read_timeout = "1m5s"
write_timeout = "1s"

# LoRaWAN region served by this bridge.
region = "EU868"

# Frequency bounds advertised in the router-config.
frequency_min = 863000000
frequency_max = 870000000

# One block per concentrator board.
[[backend.basic_station.concentrators]]
multi_sf = { frequencies = [868100000, 868300000, 868500000, 867100000, 867300000, 867500000, 867700000, 867900000] }
lora_std = { frequency = 868300000, bandwidth = 250000, spreading_factor = 7 }
fsk = { frequency = 868800000 }

# Single-gateway mode: statistics are published for the configured EUI even
# while no packet forwarder is connected.
[backend.basic_station.single]
enabled = false
gw_id = ""

[filters]
# net_ids = ["000000"]
# join_euis = [["0000000000000000", "ffffffffffffffff"]]

[logging]
level = "info"
format = "plaintext"
"#
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_without_file() {
        let settings = Settings::load(None).unwrap();
        let bs = settings.backend.basic_station;
        assert_eq!(bs.bind, "0.0.0.0:3001");
        assert_eq!(bs.stats_interval, Duration::from_secs(30));
        assert_eq!(bs.ping_interval, Duration::from_secs(60));
        assert_eq!(bs.read_timeout, Duration::from_secs(65));
        assert_eq!(bs.write_timeout, Duration::from_secs(1));
        assert_eq!(bs.region, "EU868");
        assert!(!bs.single.enabled);
    }

    #[test]
    fn parses_full_file() {
        let f = write_config(
            r#"
            [backend.basic_station]
            bind = "127.0.0.1:0"
            stats_interval = "100ms"
            ping_interval = "1s"
            read_timeout = "3s"
            write_timeout = "500ms"
            region = "US915"

            [[backend.basic_station.concentrators]]
            multi_sf = { frequencies = [902300000, 902500000] }

            [backend.basic_station.single]
            enabled = true
            gw_id = "aabbccddeeff0011"

            [filters]
            net_ids = ["00000c"]
            join_euis = [["0000000000000000", "ffffffffffffffff"]]
            "#,
        );
        let settings = Settings::load(Some(f.path())).unwrap();
        let bs = &settings.backend.basic_station;
        assert_eq!(bs.bind, "127.0.0.1:0");
        assert_eq!(bs.stats_interval, Duration::from_millis(100));
        assert_eq!(bs.region, "US915");
        assert_eq!(bs.concentrators.len(), 1);
        assert_eq!(bs.concentrators[0].multi_sf.frequencies.len(), 2);
        assert!(bs.single.enabled);
        assert_eq!(bs.single.gw_id, "aabbccddeeff0011");
        assert_eq!(settings.filters.net_ids, vec!["00000c"]);
        assert_eq!(settings.filters.join_euis.len(), 1);
    }

    #[test]
    fn rejects_ping_interval_at_or_above_read_timeout() {
        let f = write_config(
            r#"
            [backend.basic_station]
            ping_interval = "10s"
            read_timeout = "10s"
            "#,
        );
        assert!(matches!(
            Settings::load(Some(f.path())),
            Err(ConfigError::PingIntervalTooLong { .. })
        ));
    }

    #[test]
    fn rejects_single_mode_without_gw_id() {
        let f = write_config(
            r#"
            [backend.basic_station.single]
            enabled = true
            "#,
        );
        assert!(matches!(
            Settings::load(Some(f.path())),
            Err(ConfigError::SingleModeWithoutGatewayId)
        ));
    }

    #[test]
    fn template_parses_back() {
        let f = write_config(default_template());
        let settings = Settings::load(Some(f.path())).unwrap();
        assert_eq!(settings.backend.basic_station.concentrators.len(), 1);
    }
}
