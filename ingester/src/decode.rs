//! Envelope decryption and packet decoding.
//!
//! The mesh payload inside a `ServiceEnvelope` is AES-128-CTR ciphertext of
//! an encoded `Data` message. The 16-byte initial counter block is the
//! packet id (u64 little-endian) followed by the source node id (u32
//! little-endian) and four zero bytes. Gateways on the public broker also
//! forward already-decrypted packets; both paths converge on the same
//! dispatch.
//!
//! Only POSITION_APP, NODEINFO_APP, and TELEMETRY_APP survive dispatch.
//! Telemetry is further narrowed to the environment and air-quality
//! variants; device-metrics and power-metrics are dropped. Every failure is
//! a drop with a counter, never a retry.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use ctr::cipher::{KeyIvInit, StreamCipher};
use prost::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dedup::DedupFilter;
use crate::guard::{self, FutureTimestampEvent};
use crate::metrics::Metrics;
use crate::model::{
    self, NodeInfoUpdate, PacketEvent, PositionUpdate, TelemetryBatch,
};
use crate::{hardware, proto};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// The published key of the default public channel.
pub const DEFAULT_CHANNEL_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59,
    0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// One raw MQTT publish, as handed over by a region subscriber.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub region: String,
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope carries no packet")]
    EmptyEnvelope,
    #[error("payload is neither decoded nor decryptable")]
    Undecryptable,
    #[error("protobuf decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
    #[error("unsupported port {0}")]
    Unsupported(i32),
}

/// Expand a base64 channel PSK into the AES-128 key.
///
/// Length 0 selects the default key; length 1 is the Meshtastic "key index"
/// form (index 1 is the published default); length 16 is used verbatim.
/// Anything else (including undecodable input) is digested down to 16 bytes
/// so a misconfigured key still yields a deterministic, non-matching key
/// rather than a startup failure.
pub fn derive_channel_key(psk_b64: &str) -> [u8; 16] {
    let digest16 = |data: &[u8]| -> [u8; 16] {
        let d = Sha256::digest(data);
        d[..16].try_into().expect("sha256 yields at least 16 bytes")
    };
    match BASE64.decode(psk_b64.trim()) {
        Ok(raw) => match raw.len() {
            0 | 1 => DEFAULT_CHANNEL_KEY,
            16 => raw.try_into().expect("length checked"),
            _ => digest16(&raw),
        },
        Err(_) => digest16(psk_b64.as_bytes()),
    }
}

/// AES-CTR is its own inverse; the same call encrypts in `meshgen`.
pub fn apply_ctr(data: &mut [u8], packet_id: u32, from_node: u32, key: &[u8; 16]) {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    iv[8..12].copy_from_slice(&from_node.to_le_bytes());
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(data);
}

pub struct Decoder {
    key: [u8; 16],
    metrics: Arc<Metrics>,
}

impl Decoder {
    pub fn new(key: [u8; 16], metrics: Arc<Metrics>) -> Self {
        Self { key, metrics }
    }

    /// Decode one raw frame down to the inner `Data` plus its mesh metadata.
    fn open_envelope(&self, payload: &[u8]) -> Result<(proto::MeshPacket, proto::Data), DecodeError> {
        let envelope = proto::ServiceEnvelope::decode(payload)?;
        let packet = envelope.packet.ok_or(DecodeError::EmptyEnvelope)?;
        let data = match &packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => data.clone(),
            Some(proto::mesh_packet::PayloadVariant::Encrypted(ciphertext)) => {
                let mut buf = ciphertext.clone();
                apply_ctr(&mut buf, packet.id, packet.from, &self.key);
                proto::Data::decode(buf.as_slice()).map_err(|_| {
                    self.metrics.decrypt_failed.fetch_add(1, Ordering::Relaxed);
                    DecodeError::Undecryptable
                })?
            }
            None => return Err(DecodeError::Undecryptable),
        };
        Ok((packet, data))
    }

    /// Full decode: envelope, decrypt, dispatch by port. Returns `Ok(None)`
    /// for packets that are valid but carry nothing for this pipeline
    /// (device metrics, missing telemetry timestamp).
    pub fn decode(
        &self,
        region: &str,
        payload: &[u8],
        now: i64,
    ) -> Result<Option<(proto::MeshPacket, PacketEvent)>, DecodeError> {
        let (packet, data) = self.open_envelope(payload)?;
        let node = packet.from;
        let event = match proto::PortNum::try_from(data.portnum) {
            Ok(proto::PortNum::PositionApp) => {
                let pos = proto::Position::decode(data.payload.as_slice())?;
                Some(PacketEvent::Position(PositionUpdate {
                    node,
                    region: region.to_string(),
                    latitude: pos.latitude_i as f64 / 1e7,
                    longitude: pos.longitude_i as f64 / 1e7,
                    altitude: (pos.altitude != 0).then_some(pos.altitude as f64),
                    received_at: now,
                }))
            }
            Ok(proto::PortNum::NodeinfoApp) => {
                let user = proto::User::decode(data.payload.as_slice())?;
                Some(PacketEvent::NodeInfo(NodeInfoUpdate {
                    node,
                    region: region.to_string(),
                    node_name: (!user.long_name.is_empty()).then(|| user.long_name.clone()),
                    hardware_model: hardware::normalize(user.hw_model),
                }))
            }
            Ok(proto::PortNum::TelemetryApp) => {
                let telemetry = proto::Telemetry::decode(data.payload.as_slice())?;
                self.telemetry_event(region, node, &telemetry)
            }
            _ => return Err(DecodeError::Unsupported(data.portnum)),
        };
        Ok(event.map(|ev| (packet, ev)))
    }

    fn telemetry_event(
        &self,
        region: &str,
        node: u32,
        telemetry: &proto::Telemetry,
    ) -> Option<PacketEvent> {
        let sensor_time = telemetry.time as i64;
        let readings = match &telemetry.variant {
            Some(proto::telemetry::Variant::EnvironmentMetrics(em)) => {
                if sensor_time == 0 {
                    self.metrics.no_timestamp.fetch_add(1, Ordering::Relaxed);
                    debug!(node = %model::device_id(node), region, "telemetry_without_timestamp");
                    return None;
                }
                model::environment_readings(em, sensor_time)
            }
            Some(proto::telemetry::Variant::AirQualityMetrics(aq)) => {
                if sensor_time == 0 {
                    self.metrics.no_timestamp.fetch_add(1, Ordering::Relaxed);
                    debug!(node = %model::device_id(node), region, "telemetry_without_timestamp");
                    return None;
                }
                model::air_quality_readings(aq, sensor_time)
            }
            Some(proto::telemetry::Variant::DeviceMetrics(dm)) => {
                self.metrics.device_metrics_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    node = %model::device_id(node),
                    region,
                    battery = dm.battery_level.unwrap_or_default(),
                    voltage = dm.voltage.unwrap_or_default(),
                    "device_telemetry",
                );
                return None;
            }
            Some(proto::telemetry::Variant::PowerMetrics(_)) | None => return None,
        };
        if readings.is_empty() {
            return None;
        }
        Some(PacketEvent::Telemetry(TelemetryBatch {
            node,
            region: region.to_string(),
            readings,
            received_at: 0, // stamped by the worker at forward time
        }))
    }
}

/// Decode worker: raw frames in, correlator events out. Owns the dedup
/// filter and applies the future-timestamp guard, so everything reaching
/// the correlator is unique and plausibly timed. Ends when all subscribers
/// have dropped their senders.
pub async fn run_decoder(
    decoder: Decoder,
    mut dedup: DedupFilter,
    mut raw_rx: mpsc::Receiver<RawFrame>,
    event_tx: mpsc::Sender<PacketEvent>,
    ft_tx: mpsc::Sender<FutureTimestampEvent>,
    metrics: Arc<Metrics>,
) {
    while let Some(frame) = raw_rx.recv().await {
        metrics.messages.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp();

        let (packet, mut event) = match decoder.decode(&frame.region, &frame.payload, now) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => continue,
            Err(DecodeError::Unsupported(port)) => {
                metrics.unsupported.fetch_add(1, Ordering::Relaxed);
                debug!(region = frame.region.as_str(), port, "unsupported_packet");
                continue;
            }
            Err(DecodeError::Undecryptable) => {
                debug!(region = frame.region.as_str(), "decrypt_failed");
                continue;
            }
            Err(e) => {
                metrics.decode_failed.fetch_add(1, Ordering::Relaxed);
                debug!(region = frame.region.as_str(), error = %e, "decode_failed");
                continue;
            }
        };

        if dedup.check_and_insert(packet.from, packet.id, now) {
            metrics.deduped.fetch_add(1, Ordering::Relaxed);
            debug!(
                node = %model::device_id(packet.from),
                packet_id = packet.id,
                region = frame.region.as_str(),
                "dedup_drop",
            );
            continue;
        }
        metrics.dedup_size.store(dedup.len() as u64, Ordering::Relaxed);

        match event {
            PacketEvent::Telemetry(ref mut batch) => {
                batch.received_at = now;
                if let Some(first) = batch.readings.first() {
                    if let Some(delta) = guard::future_delta(first.sensor_time, now) {
                        metrics.future_dropped.fetch_add(1, Ordering::Relaxed);
                        let _ = ft_tx.try_send(FutureTimestampEvent {
                            node: batch.node,
                            region: batch.region.clone(),
                            sensor_time: first.sensor_time,
                            delta_seconds: delta,
                        });
                        continue;
                    }
                }
                metrics.region(&frame.region).environmental.fetch_add(1, Ordering::Relaxed);
            }
            PacketEvent::Position(_) => {
                metrics.region(&frame.region).positions.fetch_add(1, Ordering::Relaxed);
            }
            PacketEvent::NodeInfo(_) => {}
        }

        if event_tx.send(event).await.is_err() {
            break; // correlator gone; shutting down
        }
    }
}
