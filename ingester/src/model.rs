//! Core pipeline types: node identity, reading types, decoded packet events,
//! and the correlated output record.

use serde::{Deserialize, Serialize};

use crate::proto;

/// Every record leaving this ingester is labelled with this source.
pub const DATA_SOURCE: &str = "MESHTASTIC";

/// Render a raw 32-bit node number as the downstream device identifier,
/// e.g. `0xa1b2c3d4` -> `meshtastic_a1b2c3d4`.
pub fn device_id(node: u32) -> String {
    format!("meshtastic_{node:08x}")
}

/// Closed set of environmental reading types this ingester emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingType {
    Temperature,
    Humidity,
    Pressure,
    Co2,
    Voc,
    Pm2_5,
    Pm10,
    Lux,
    WindSpeed,
    WindDirection,
    Rainfall,
    Iaq,
}

impl ReadingType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadingType::Temperature => "temperature",
            ReadingType::Humidity => "humidity",
            ReadingType::Pressure => "pressure",
            ReadingType::Co2 => "co2",
            ReadingType::Voc => "voc",
            ReadingType::Pm2_5 => "pm2_5",
            ReadingType::Pm10 => "pm10",
            ReadingType::Lux => "lux",
            ReadingType::WindSpeed => "wind_speed",
            ReadingType::WindDirection => "wind_direction",
            ReadingType::Rainfall => "rainfall",
            ReadingType::Iaq => "iaq",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            ReadingType::Temperature => "°C",
            ReadingType::Humidity => "%",
            ReadingType::Pressure => "hPa",
            ReadingType::Co2 => "ppm",
            ReadingType::Voc => "MΩ",
            ReadingType::Pm2_5 | ReadingType::Pm10 => "µg/m³",
            ReadingType::Lux => "lx",
            ReadingType::WindSpeed => "m/s",
            ReadingType::WindDirection => "°",
            ReadingType::Rainfall => "mm",
            ReadingType::Iaq => "",
        }
    }
}

impl std::fmt::Display for ReadingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One environmental measurement as declared by the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub reading_type: ReadingType,
    pub value: f64,
    /// Sensor-declared unix epoch seconds. Canonical timestamp downstream.
    pub sensor_time: i64,
}

impl TelemetryReading {
    pub fn unit(&self) -> &'static str {
        self.reading_type.unit()
    }
}

/// Extract the supported reading set from an environment metrics block.
/// Optional fields that the node did not report are absent on the wire;
/// integer fields reported as exactly zero are treated as unreported.
pub fn environment_readings(em: &proto::EnvironmentMetrics, sensor_time: i64) -> Vec<TelemetryReading> {
    let mut out = Vec::new();
    let mut push_f = |reading_type: ReadingType, v: Option<f32>| {
        if let Some(v) = v {
            out.push(TelemetryReading { reading_type, value: v as f64, sensor_time });
        }
    };
    push_f(ReadingType::Temperature, em.temperature);
    push_f(ReadingType::Humidity, em.relative_humidity);
    push_f(ReadingType::Pressure, em.barometric_pressure);
    push_f(ReadingType::Voc, em.gas_resistance);
    push_f(ReadingType::Lux, em.lux);
    push_f(ReadingType::WindSpeed, em.wind_speed);
    push_f(ReadingType::Rainfall, em.rainfall_1h);
    if let Some(v) = em.iaq.filter(|&v| v != 0) {
        out.push(TelemetryReading { reading_type: ReadingType::Iaq, value: v as f64, sensor_time });
    }
    if let Some(v) = em.wind_direction.filter(|&v| v != 0) {
        out.push(TelemetryReading {
            reading_type: ReadingType::WindDirection,
            value: v as f64,
            sensor_time,
        });
    }
    out
}

/// Extract co2 / pm readings from the air-quality block. All integer fields:
/// zero means unreported.
pub fn air_quality_readings(aq: &proto::AirQualityMetrics, sensor_time: i64) -> Vec<TelemetryReading> {
    let mut out = Vec::new();
    let mut push_u = |reading_type: ReadingType, v: Option<u32>| {
        if let Some(v) = v.filter(|&v| v != 0) {
            out.push(TelemetryReading { reading_type, value: v as f64, sensor_time });
        }
    };
    push_u(ReadingType::Co2, aq.co2);
    push_u(ReadingType::Pm2_5, aq.pm25_standard);
    push_u(ReadingType::Pm10, aq.pm100_standard);
    out
}

/// A position broadcast observed on the mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionUpdate {
    pub node: u32,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub received_at: i64,
}

/// A node identity broadcast (long name + hardware model).
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfoUpdate {
    pub node: u32,
    pub region: String,
    pub node_name: Option<String>,
    pub hardware_model: Option<String>,
}

/// A telemetry packet that passed the dedup filter and the timestamp guard.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryBatch {
    pub node: u32,
    pub region: String,
    pub readings: Vec<TelemetryReading>,
    pub received_at: i64,
}

/// Decoded work flowing from the decode stage into the correlator.
#[derive(Clone, Debug, PartialEq)]
pub enum PacketEvent {
    Position(PositionUpdate),
    NodeInfo(NodeInfoUpdate),
    Telemetry(TelemetryBatch),
}

/// The correlated output: one reading joined with its node's position and
/// resolved geography. Produced, written, discarded.
#[derive(Clone, Debug, Serialize)]
pub struct EnrichedRecord {
    pub node: u32,
    pub device_id: String,
    pub node_name: Option<String>,
    pub board_model: Option<String>,
    pub reading_type: ReadingType,
    pub value: f64,
    pub unit: &'static str,
    pub sensor_time: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub country: String,
    pub subdivision: String,
    pub data_source: &'static str,
    pub region: String,
    pub ingestion_node_id: String,
    pub received_at: i64,
    /// Age of the joined position at correlation time, for downstream
    /// staleness judgement.
    pub position_age_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_lowercase_hex_with_prefix() {
        assert_eq!(device_id(0xA1B2C3D4), "meshtastic_a1b2c3d4");
        assert_eq!(device_id(0xDEADBEEF), "meshtastic_deadbeef");
        assert_eq!(device_id(0x42), "meshtastic_00000042");
    }

    #[test]
    fn environment_readings_keep_reported_zero_floats() {
        // 0.0 °C is a real temperature; float fields use wire presence, not
        // a zero sentinel.
        let em = proto::EnvironmentMetrics {
            temperature: Some(0.0),
            relative_humidity: Some(65.0),
            ..Default::default()
        };
        let readings = environment_readings(&em, 1000);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].reading_type, ReadingType::Temperature);
        assert_eq!(readings[0].value, 0.0);
    }

    #[test]
    fn environment_readings_drop_zero_integers() {
        let em = proto::EnvironmentMetrics {
            iaq: Some(0),
            wind_direction: Some(0),
            ..Default::default()
        };
        assert!(environment_readings(&em, 1000).is_empty());
    }

    #[test]
    fn air_quality_maps_pm_fields() {
        let aq = proto::AirQualityMetrics {
            pm10_standard: Some(3), // PM1.0, not in the output set
            pm25_standard: Some(12),
            pm100_standard: Some(20),
            co2: Some(0), // unreported
            ..Default::default()
        };
        let readings = air_quality_readings(&aq, 1000);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].reading_type, ReadingType::Pm2_5);
        assert_eq!(readings[0].value, 12.0);
        assert_eq!(readings[1].reading_type, ReadingType::Pm10);
        assert_eq!(readings[1].value, 20.0);
    }

    #[test]
    fn reading_type_serializes_snake_case() {
        let json = serde_json::to_string(&ReadingType::Pm2_5).unwrap();
        assert_eq!(json, "\"pm2_5\"");
        assert_eq!(ReadingType::WindSpeed.as_str(), "wind_speed");
    }
}
