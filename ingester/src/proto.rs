// =============================================================================
// Meshtastic wire types (matches mqtt.proto / mesh.proto / telemetry.proto)
// =============================================================================
// Defined manually; only the fields this ingester reads are carried, with
// tags matching the upstream schema.
// =============================================================================

/// Application port numbers carried in `Data.portnum`. Only the subset this
/// ingester can encounter is listed; everything else decodes as a raw i32 and
/// falls through the dispatch as unsupported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    MapReportApp = 73,
}

/// Outer message published by Meshtastic MQTT gateways.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        /// Cleartext inner packet (gateway already decrypted it).
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        /// AES-CTR ciphertext of an encoded `Data` message.
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

/// Inner packet, one per application payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
}

/// POSITION_APP payload. Coordinates are degrees * 1e7.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

/// NODEINFO_APP payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bytes, tag = "4")]
    pub macaddr: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
}

/// TELEMETRY_APP payload. `time` is the sensor-declared unix epoch seconds.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3, 4, 5")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
        #[prost(message, tag = "4")]
        AirQualityMetrics(super::AirQualityMetrics),
        #[prost(message, tag = "5")]
        PowerMetrics(super::PowerMetrics),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

/// Environmental sensor block. Fields are proto3 `optional`; absence means
/// the node carries no such sensor.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub gas_resistance: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub current: Option<f32>,
    #[prost(uint32, optional, tag = "7")]
    pub iaq: Option<u32>,
    #[prost(float, optional, tag = "9")]
    pub lux: Option<f32>,
    #[prost(uint32, optional, tag = "13")]
    pub wind_direction: Option<u32>,
    #[prost(float, optional, tag = "14")]
    pub wind_speed: Option<f32>,
    #[prost(float, optional, tag = "19")]
    pub rainfall_1h: Option<f32>,
    #[prost(float, optional, tag = "20")]
    pub rainfall_24h: Option<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AirQualityMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub pm10_standard: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub pm25_standard: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub pm100_standard: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub co2: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PowerMetrics {
    #[prost(float, optional, tag = "1")]
    pub ch1_voltage: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub ch1_current: Option<f32>,
}
