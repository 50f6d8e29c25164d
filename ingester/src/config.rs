//! Runtime configuration, frozen at startup.
//!
//! One JSON file enumerates the upstream MQTT regions; everything else comes
//! from environment variables. Malformed configuration aborts the process
//! before any worker is spawned; a restart is the reconfiguration
//! mechanism, there is no runtime reload.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// Which upstream profile to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Single `LOCAL` region described by the plain `MQTT_*` env vars.
    Community,
    /// Multi-region fleet from the regions config file.
    Public,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RegionConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub topic: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Clone, Debug)]
pub struct OutputMqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct GeocoderConfig {
    pub gazetteer_path: Option<PathBuf>,
    pub online: bool,
    pub nominatim_url: String,
    pub user_agent: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub channel_key_b64: String,
    pub ingestion_node_id: String,
    pub regions: BTreeMap<String, RegionConfig>,
    pub output: Option<OutputMqttConfig>,
    pub clickhouse: Option<ClickHouseConfig>,
    pub geocoder: GeocoderConfig,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub stats_interval_secs: u64,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_max_bytes: u64,
    pub log_backup_count: usize,
    pub debug: bool,
    pub timezone: Option<String>,
}

impl Config {
    pub fn position_cache_path(&self) -> PathBuf {
        self.cache_dir.join("position_cache.json")
    }

    pub fn pending_telemetry_path(&self) -> PathBuf {
        self.cache_dir.join("pending_telemetry.json")
    }

    pub fn geocoding_cache_path(&self) -> PathBuf {
        self.cache_dir.join("geocoding_cache.json")
    }

    pub fn load() -> Result<Self> {
        let mode = match env::var("MESHTASTIC_MODE")
            .unwrap_or_else(|_| "community".into())
            .to_lowercase()
            .as_str()
        {
            "community" => Mode::Community,
            "public" => Mode::Public,
            other => bail!("MESHTASTIC_MODE must be 'public' or 'community', got '{other}'"),
        };

        let regions = match mode {
            Mode::Community => {
                let mut m = BTreeMap::new();
                m.insert(
                    "LOCAL".to_string(),
                    RegionConfig {
                        broker: env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".into()),
                        port: env_parse("MQTT_PORT", 1883)?,
                        username: env::var("MQTT_USERNAME").unwrap_or_default(),
                        password: env::var("MQTT_PASSWORD").unwrap_or_default(),
                        topic: env::var("MQTT_SUBSCRIBE_TOPIC")
                            .unwrap_or_else(|_| "msh/+/2/e/#".into()),
                        enabled: true,
                    },
                );
                m
            }
            Mode::Public => {
                let path = env::var("MQTT_REGIONS_FILE")
                    .unwrap_or_else(|_| "config/mqtt_regions.json".into());
                load_regions_file(&path)?
            }
        };

        if !regions.values().any(|r| r.enabled) {
            bail!("no enabled MQTT regions configured");
        }

        let output = match env::var("WESENSE_OUTPUT_BROKER") {
            Ok(broker) if !broker.is_empty() => Some(OutputMqttConfig {
                broker,
                port: env_parse("WESENSE_OUTPUT_PORT", 1883)?,
                username: env::var("WESENSE_OUTPUT_USERNAME").ok().filter(|s| !s.is_empty()),
                password: env::var("WESENSE_OUTPUT_PASSWORD").ok().filter(|s| !s.is_empty()),
            }),
            _ => None,
        };

        let clickhouse = match env::var("CLICKHOUSE_HOST") {
            Ok(host) if !host.is_empty() => Some(ClickHouseConfig {
                host,
                port: env_parse("CLICKHOUSE_PORT", 8123)?,
                database: env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "wesense".into()),
                table: env::var("CLICKHOUSE_TABLE").unwrap_or_else(|_| "sensor_readings".into()),
                username: env::var("CLICKHOUSE_USERNAME").unwrap_or_else(|_| "default".into()),
                password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            }),
            _ => None,
        };

        let geocoder = GeocoderConfig {
            gazetteer_path: env::var("GAZETTEER_PATH").ok().map(PathBuf::from),
            online: env_parse("GEOCODER_ONLINE", true)?,
            nominatim_url: env::var("NOMINATIM_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org/reverse".into()),
            user_agent: env::var("GEOCODER_USER_AGENT").unwrap_or_else(|_| "WeSense/1.0".into()),
        };

        Ok(Config {
            mode,
            channel_key_b64: env::var("MESHTASTIC_CHANNEL_KEY").unwrap_or_else(|_| "AQ==".into()),
            ingestion_node_id: env::var("INGESTION_NODE_ID")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or_else(|_| "unknown-host".into()),
            regions,
            output,
            clickhouse,
            geocoder,
            batch_size: env_parse("CLICKHOUSE_BATCH_SIZE", 100usize)?,
            flush_interval: Duration::from_secs(env_parse("CLICKHOUSE_FLUSH_INTERVAL", 10u64)?),
            stats_interval_secs: env_parse("STATS_INTERVAL", 10u64)?,
            cache_dir: PathBuf::from(env::var("CACHE_DIR").unwrap_or_else(|_| "cache".into())),
            log_dir: PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "logs".into())),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_max_bytes: env_parse("LOG_MAX_BYTES", 10 * 1024 * 1024u64)?,
            log_backup_count: env_parse("LOG_BACKUP_COUNT", 5usize)?,
            debug: env_parse("DEBUG", false)?,
            timezone: env::var("TZ").ok(),
        })
    }

    pub fn enabled_regions(&self) -> impl Iterator<Item = (&String, &RegionConfig)> {
        self.regions.iter().filter(|(_, r)| r.enabled)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {name}='{raw}': {e}")),
        _ => Ok(default),
    }
}

fn load_regions_file(path: &str) -> Result<BTreeMap<String, RegionConfig>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("reading regions config {path}"))?;
    let raw: BTreeMap<String, RegionConfig> =
        serde_json::from_str(&body).with_context(|| format!("parsing regions config {path}"))?;
    // Historical configs prefix not-yet-verified regions; strip it.
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k.replace("untested_", ""), v))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regions_file_parses_and_strips_prefix() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "ANZ": {{"broker": "mqtt.example.org", "topic": "msh/ANZ/#", "enabled": true}},
                "untested_EU_868": {{"broker": "mqtt.eu.example.org", "port": 8883,
                                     "username": "u", "password": "p",
                                     "topic": "msh/EU_868/#"}}
            }}"#
        )
        .unwrap();
        let regions = load_regions_file(f.path().to_str().unwrap()).unwrap();
        assert_eq!(regions.len(), 2);
        let anz = &regions["ANZ"];
        assert!(anz.enabled);
        assert_eq!(anz.port, 1883);
        let eu = &regions["EU_868"];
        assert!(!eu.enabled);
        assert_eq!(eu.port, 8883);
    }

    #[test]
    fn missing_regions_file_is_an_error() {
        assert!(load_regions_file("/nonexistent/regions.json").is_err());
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("TEST_ENV_PARSE_PORT", "not-a-number");
        let out: Result<u16> = env_parse("TEST_ENV_PARSE_PORT", 1883);
        assert!(out.is_err());
        std::env::remove_var("TEST_ENV_PARSE_PORT");
    }

    #[test]
    fn env_parse_defaults_when_unset() {
        let out: u16 = env_parse("TEST_ENV_PARSE_UNSET", 8123).unwrap();
        assert_eq!(out, 8123);
    }
}
