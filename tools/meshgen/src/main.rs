// =============================================================================
// WESENSE MESH INGEST — Mesh Traffic Generator
// =============================================================================
// Publishes properly encrypted Meshtastic ServiceEnvelope payloads (positions
// and environmental telemetry) to an MQTT broker at configurable rates, with
// optional duplicate floods to exercise the ingester's dedup filter.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use ctr::cipher::{KeyIvInit, StreamCipher};
use prost::Message;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const DEFAULT_CHANNEL_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59,
    0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

// Wire types matching the ingester
pub mod proto {
    #[derive(Clone, prost::Message)]
    pub struct ServiceEnvelope {
        #[prost(message, optional, tag = "1")]
        pub packet: Option<MeshPacket>,
        #[prost(string, tag = "2")]
        pub channel_id: String,
        #[prost(string, tag = "3")]
        pub gateway_id: String,
    }

    #[derive(Clone, prost::Message)]
    pub struct MeshPacket {
        #[prost(fixed32, tag = "1")]
        pub from: u32,
        #[prost(fixed32, tag = "2")]
        pub to: u32,
        #[prost(bytes, tag = "5")]
        pub encrypted: Vec<u8>,
        #[prost(fixed32, tag = "6")]
        pub id: u32,
        #[prost(uint32, tag = "9")]
        pub hop_limit: u32,
    }

    #[derive(Clone, prost::Message)]
    pub struct Data {
        #[prost(int32, tag = "1")]
        pub portnum: i32,
        #[prost(bytes, tag = "2")]
        pub payload: Vec<u8>,
    }

    #[derive(Clone, prost::Message)]
    pub struct Position {
        #[prost(sfixed32, tag = "1")]
        pub latitude_i: i32,
        #[prost(sfixed32, tag = "2")]
        pub longitude_i: i32,
        #[prost(int32, tag = "3")]
        pub altitude: i32,
    }

    #[derive(Clone, prost::Message)]
    pub struct Telemetry {
        #[prost(fixed32, tag = "1")]
        pub time: u32,
        #[prost(message, optional, tag = "3")]
        pub environment_metrics: Option<EnvironmentMetrics>,
    }

    #[derive(Clone, prost::Message)]
    pub struct EnvironmentMetrics {
        #[prost(float, optional, tag = "1")]
        pub temperature: Option<f32>,
        #[prost(float, optional, tag = "2")]
        pub relative_humidity: Option<f32>,
        #[prost(float, optional, tag = "3")]
        pub barometric_pressure: Option<f32>,
    }

    pub const POSITION_APP: i32 = 3;
    pub const TELEMETRY_APP: i32 = 67;
}

#[derive(Parser)]
#[command(name = "meshgen")]
#[command(about = "Mesh traffic generator for the WeSense ingester")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    broker: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Topic prefix (envelope topics are {prefix}/!{gateway})
    #[arg(long, default_value = "msh/LOCAL/2/e")]
    topic_prefix: String,

    /// Telemetry packets per second
    #[arg(long, default_value_t = 10)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct simulated nodes
    #[arg(long, default_value_t = 5)]
    nodes: usize,

    /// Channel PSK (base64); default selects the published community key
    #[arg(long, default_value = "AQ==")]
    key: String,

    /// Center latitude
    #[arg(long, default_value_t = -36.8485)]
    lat: f64,

    /// Center longitude
    #[arg(long, default_value_t = 174.7633)]
    lon: f64,

    /// Send every telemetry packet this many times (mesh-flood simulation)
    #[arg(long, default_value_t = 1)]
    flood: u32,

    /// Fraction of nodes that never announce a position
    #[arg(long, default_value_t = 0.0)]
    silent_position_ratio: f64,
}

struct Counters {
    positions: AtomicU64,
    telemetry: AtomicU64,
    floods: AtomicU64,
    errors: AtomicU64,
}

fn channel_key(psk_b64: &str) -> [u8; 16] {
    match BASE64.decode(psk_b64.trim()) {
        Ok(raw) if raw.len() == 16 => raw.try_into().expect("length checked"),
        _ => DEFAULT_CHANNEL_KEY,
    }
}

fn encrypt(data: &proto::Data, packet_id: u32, from: u32, key: &[u8; 16]) -> Vec<u8> {
    let mut buf = data.encode_to_vec();
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    iv[8..12].copy_from_slice(&from.to_le_bytes());
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);
    buf
}

fn envelope(data: &proto::Data, from: u32, packet_id: u32, key: &[u8; 16]) -> Vec<u8> {
    proto::ServiceEnvelope {
        packet: Some(proto::MeshPacket {
            from,
            to: 0xffffffff,
            encrypted: encrypt(data, packet_id, from, key),
            id: packet_id,
            hop_limit: 3,
        }),
        channel_id: "LongFast".into(),
        gateway_id: format!("!{from:08x}"),
    }
    .encode_to_vec()
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let key = channel_key(&args.key);
    let counters = Arc::new(Counters {
        positions: AtomicU64::new(0),
        telemetry: AtomicU64::new(0),
        floods: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });

    let mut options = MqttOptions::new("meshgen", args.broker.clone(), args.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 256);
    tokio::spawn(async move {
        loop {
            if eventloop.poll().await.is_err() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut rng = rand::thread_rng();
    let nodes: Vec<u32> = (0..args.nodes).map(|_| rng.gen()).collect();
    let silent = (args.nodes as f64 * args.silent_position_ratio) as usize;
    println!(
        "meshgen: {} nodes ({} position-silent), {}/s for {}s, flood x{} -> {}:{}",
        args.nodes, silent, args.rate, args.duration, args.flood, args.broker, args.port
    );

    // Announce positions for the talkative nodes, scattered ~1km around the
    // center.
    let mut packet_id: u32 = rng.gen();
    for &node in nodes.iter().skip(silent) {
        packet_id = packet_id.wrapping_add(1);
        let data = proto::Data {
            portnum: proto::POSITION_APP,
            payload: proto::Position {
                latitude_i: ((args.lat + rng.gen_range(-0.01..0.01)) * 1e7) as i32,
                longitude_i: ((args.lon + rng.gen_range(-0.01..0.01)) * 1e7) as i32,
                altitude: rng.gen_range(0..200),
            }
            .encode_to_vec(),
        };
        let topic = format!("{}/!{:08x}", args.topic_prefix, node);
        let payload = envelope(&data, node, packet_id, &key);
        match client.publish(topic, QoS::AtMostOnce, false, payload).await {
            Ok(()) => counters.positions.fetch_add(1, Ordering::Relaxed),
            Err(_) => counters.errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    let started = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    while started.elapsed() < Duration::from_secs(args.duration) {
        tick.tick().await;
        packet_id = packet_id.wrapping_add(1);
        let node = nodes[rng.gen_range(0..nodes.len())];
        let data = proto::Data {
            portnum: proto::TELEMETRY_APP,
            payload: proto::Telemetry {
                time: now_secs(),
                environment_metrics: Some(proto::EnvironmentMetrics {
                    temperature: Some(rng.gen_range(-5.0..35.0)),
                    relative_humidity: Some(rng.gen_range(20.0..95.0)),
                    barometric_pressure: Some(rng.gen_range(980.0..1040.0)),
                }),
            }
            .encode_to_vec(),
        };
        let topic = format!("{}/!{:08x}", args.topic_prefix, node);
        let payload = envelope(&data, node, packet_id, &key);
        for copy in 0..args.flood.max(1) {
            match client
                .publish(topic.clone(), QoS::AtMostOnce, false, payload.clone())
                .await
            {
                Ok(()) => {
                    if copy == 0 {
                        counters.telemetry.fetch_add(1, Ordering::Relaxed);
                    } else {
                        counters.floods.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(_) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            };
        }
    }

    // Give the event loop a moment to push the tail out.
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!(
        "meshgen done: positions={} telemetry={} flood_copies={} errors={}",
        counters.positions.load(Ordering::Relaxed),
        counters.telemetry.load(Ordering::Relaxed),
        counters.floods.load(Ordering::Relaxed),
        counters.errors.load(Ordering::Relaxed),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parsing_defaults_to_community_key() {
        assert_eq!(channel_key("AQ=="), DEFAULT_CHANNEL_KEY);
        assert_eq!(channel_key("garbage!!"), DEFAULT_CHANNEL_KEY);
        let custom = BASE64.encode([9u8; 16]);
        assert_eq!(channel_key(&custom), [9u8; 16]);
    }

    #[test]
    fn envelope_roundtrip_decrypts_with_same_key() {
        let data = proto::Data {
            portnum: proto::POSITION_APP,
            payload: vec![1, 2, 3, 4],
        };
        let from = 0xa1b2c3d4;
        let id = 99;
        let bytes = envelope(&data, from, id, &DEFAULT_CHANNEL_KEY);
        let env = proto::ServiceEnvelope::decode(bytes.as_slice()).unwrap();
        let packet = env.packet.unwrap();
        assert_eq!(packet.from, from);
        // CTR is symmetric: applying the keystream again restores plaintext.
        let mut buf = packet.encrypted.clone();
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&(id as u64).to_le_bytes());
        iv[8..12].copy_from_slice(&from.to_le_bytes());
        let mut cipher = Aes128Ctr::new((&DEFAULT_CHANNEL_KEY).into(), &iv.into());
        cipher.apply_keystream(&mut buf);
        let back = proto::Data::decode(buf.as_slice()).unwrap();
        assert_eq!(back.payload, vec![1, 2, 3, 4]);
    }
}
