//! End-to-end pipeline tests: raw encrypted envelopes in, enriched records
//! out, exercising decode, dedup, the timestamp guard, correlation, the
//! async geocoder, and restart recovery: everything except live MQTT and
//! the columnar store.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wesense_mesh_ingest::correlator::{run_correlator, Correlator};
use wesense_mesh_ingest::decode::{apply_ctr, run_decoder, Decoder, RawFrame, DEFAULT_CHANNEL_KEY};
use wesense_mesh_ingest::dedup::DedupFilter;
use wesense_mesh_ingest::geocode::gazetteer::Gazetteer;
use wesense_mesh_ingest::geocode::{run_resolver, ReverseGeocoder};
use wesense_mesh_ingest::guard::FutureTimestampEvent;
use wesense_mesh_ingest::metrics::Metrics;
use wesense_mesh_ingest::model::{EnrichedRecord, PacketEvent, ReadingType, TelemetryReading};
use wesense_mesh_ingest::pending::PendingBuffer;
use wesense_mesh_ingest::position::PositionCache;
use wesense_mesh_ingest::proto;

fn encrypted_envelope(data: proto::Data, from: u32, id: u32) -> Vec<u8> {
    let mut ciphertext = data.encode_to_vec();
    apply_ctr(&mut ciphertext, id, from, &DEFAULT_CHANNEL_KEY);
    proto::ServiceEnvelope {
        packet: Some(proto::MeshPacket {
            from,
            id,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(ciphertext)),
            ..Default::default()
        }),
        channel_id: "LongFast".into(),
        gateway_id: "!feedf00d".into(),
    }
    .encode_to_vec()
}

fn position_envelope(from: u32, id: u32, lat: f64, lon: f64) -> Vec<u8> {
    encrypted_envelope(
        proto::Data {
            portnum: proto::PortNum::PositionApp as i32,
            payload: proto::Position {
                latitude_i: (lat * 1e7) as i32,
                longitude_i: (lon * 1e7) as i32,
                altitude: 0,
                time: 0,
            }
            .encode_to_vec(),
            ..Default::default()
        },
        from,
        id,
    )
}

fn temperature_envelope(from: u32, id: u32, value: f32, sensor_time: i64) -> Vec<u8> {
    encrypted_envelope(
        proto::Data {
            portnum: proto::PortNum::TelemetryApp as i32,
            payload: proto::Telemetry {
                time: sensor_time as u32,
                variant: Some(proto::telemetry::Variant::EnvironmentMetrics(
                    proto::EnvironmentMetrics {
                        temperature: Some(value),
                        ..Default::default()
                    },
                )),
            }
            .encode_to_vec(),
            ..Default::default()
        },
        from,
        id,
    )
}

struct Pipeline {
    raw_tx: mpsc::Sender<RawFrame>,
    record_rx: mpsc::Receiver<EnrichedRecord>,
    ft_rx: mpsc::Receiver<FutureTimestampEvent>,
    geocoder: Arc<ReverseGeocoder>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

/// Wire decode -> correlate -> record channel with a live gazetteer-only
/// resolver, exactly as the supervisor does minus MQTT and the sink.
fn pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();
    let now = chrono::Utc::now().timestamp();

    let (raw_tx, raw_rx) = mpsc::channel(1024);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (record_tx, record_rx) = mpsc::channel(1024);
    let (resolve_tx, resolve_rx) = mpsc::channel(64);
    let (ft_tx, ft_rx) = mpsc::channel(64);
    let (_ctl_tx, ctl_rx) = mpsc::channel(4);

    let geocoder = Arc::new(ReverseGeocoder::new(
        dir.path().join("geocoding_cache.json"),
        resolve_tx,
        metrics.clone(),
    ));
    tokio::spawn(run_resolver(
        geocoder.clone(),
        resolve_rx,
        Some(Gazetteer::builtin()),
        None,
        shutdown.clone(),
    ));
    tokio::spawn(run_decoder(
        Decoder::new(DEFAULT_CHANNEL_KEY, metrics.clone()),
        DedupFilter::new(60, 100_000),
        raw_rx,
        event_tx,
        ft_tx,
        metrics.clone(),
    ));
    let correlator = Correlator::new(
        PositionCache::new(dir.path().join("position_cache.json"), now),
        PendingBuffer::new(dir.path().join("pending_telemetry.json"), now),
        geocoder.clone(),
        record_tx,
        metrics,
        "test-ingester".into(),
    );
    tokio::spawn(run_correlator(correlator, event_rx, ctl_rx));

    Pipeline { raw_tx, record_rx, ft_rx, geocoder, shutdown, _dir: dir }
}

impl Pipeline {
    async fn send(&self, payload: Vec<u8>) {
        self.raw_tx
            .send(RawFrame {
                region: "ANZ".into(),
                topic: "msh/ANZ/2/e/LongFast/!feedf00d".into(),
                payload: payload.into(),
            })
            .await
            .unwrap();
    }

    async fn next_record(&mut self) -> EnrichedRecord {
        tokio::time::timeout(Duration::from_secs(5), self.record_rx.recv())
            .await
            .expect("timed out waiting for record")
            .expect("record channel closed")
    }

    async fn expect_no_record(&mut self) {
        let out = tokio::time::timeout(Duration::from_millis(300), self.record_rx.recv()).await;
        assert!(out.is_err(), "unexpected record: {:?}", out);
    }
}

#[tokio::test]
async fn position_then_telemetry_produces_enriched_record() {
    let mut p = pipeline();
    let now = chrono::Utc::now().timestamp();
    let node = 0xa1b2c3d4;

    p.send(position_envelope(node, 1, -36.8485, 174.7633)).await;
    p.send(temperature_envelope(node, 2, 22.5, now)).await;

    // The first record goes out before the async geocoder answers.
    let first = p.next_record().await;
    assert_eq!(first.device_id, "meshtastic_a1b2c3d4");
    assert_eq!(first.reading_type, ReadingType::Temperature);
    assert_eq!(first.value, 22.5);
    assert_eq!(first.country, "unknown");

    // Once the locality is resolved, the next reading carries codes.
    for _ in 0..200 {
        if p.geocoder.len() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    p.send(temperature_envelope(node, 3, 23.0, now + 1)).await;
    let second = p.next_record().await;
    assert_eq!(second.country, "nz");
    assert_eq!(second.subdivision, "auk");
    assert_eq!(second.sensor_time, now + 1);
    p.shutdown.cancel();
}

#[tokio::test]
async fn telemetry_before_position_is_drained_on_arrival() {
    let mut p = pipeline();
    let now = chrono::Utc::now().timestamp();
    let node = 0xdeadbeef;

    p.send(temperature_envelope(node, 10, 18.5, now)).await;
    p.expect_no_record().await;

    p.send(position_envelope(node, 11, 51.5074, -0.1278)).await;
    let record = p.next_record().await;
    assert_eq!(record.device_id, "meshtastic_deadbeef");
    assert_eq!(record.value, 18.5);
    assert_eq!(record.sensor_time, now);
    p.shutdown.cancel();
}

#[tokio::test]
async fn duplicate_flood_yields_a_single_record() {
    let mut p = pipeline();
    let now = chrono::Utc::now().timestamp();
    let node = 0x0badcafe;

    p.send(position_envelope(node, 20, -41.2866, 174.7756)).await;
    // Same packet id delivered three times by different gateways.
    for _ in 0..3 {
        p.send(temperature_envelope(node, 21, 14.0, now)).await;
    }
    let record = p.next_record().await;
    assert_eq!(record.value, 14.0);
    p.expect_no_record().await;
    p.shutdown.cancel();
}

#[tokio::test]
async fn future_clock_telemetry_is_rejected_and_logged() {
    let mut p = pipeline();
    let now = chrono::Utc::now().timestamp();
    let node = 0x11223344;

    p.send(position_envelope(node, 30, -36.8485, 174.7633)).await;
    p.send(temperature_envelope(node, 31, 21.0, now + 3600)).await;
    p.expect_no_record().await;

    let ev = tokio::time::timeout(Duration::from_secs(5), p.ft_rx.recv())
        .await
        .expect("timed out waiting for guard event")
        .expect("guard channel closed");
    assert_eq!(ev.node, node);
    assert_eq!(ev.region, "ANZ");
    assert!(ev.delta_seconds > 3500, "delta was {}", ev.delta_seconds);
    p.shutdown.cancel();
}

#[tokio::test]
async fn restart_recovers_position_cache() {
    let dir = tempfile::tempdir().unwrap();
    let position_path = dir.path().join("position_cache.json");
    let pending_path = dir.path().join("pending_telemetry.json");
    let geocache_path = dir.path().join("geocoding_cache.json");
    let metrics = Arc::new(Metrics::new());
    let now = chrono::Utc::now().timestamp();

    // First run: observe a position, snapshot, shut down.
    {
        let (resolve_tx, _resolve_rx) = mpsc::channel(16);
        let geocoder = Arc::new(ReverseGeocoder::new(
            geocache_path.clone(),
            resolve_tx,
            metrics.clone(),
        ));
        let (record_tx, _record_rx) = mpsc::channel(16);
        let mut correlator = Correlator::new(
            PositionCache::new(position_path.clone(), now),
            PendingBuffer::new(pending_path.clone(), now),
            geocoder,
            record_tx,
            metrics.clone(),
            "test-ingester".into(),
        );
        correlator
            .handle_event(
                PacketEvent::Position(wesense_mesh_ingest::model::PositionUpdate {
                    node: 0x5eed1234,
                    region: "ANZ".into(),
                    latitude: -36.8485,
                    longitude: 174.7633,
                    altitude: None,
                    received_at: now - 300,
                }),
                now - 300,
            )
            .await;
        correlator.snapshot(now - 300);
    }

    // Second run: the restored cache correlates fresh telemetry.
    let (resolve_tx, _resolve_rx) = mpsc::channel(16);
    let geocoder = Arc::new(ReverseGeocoder::new(geocache_path, resolve_tx, metrics.clone()));
    let (record_tx, mut record_rx) = mpsc::channel(16);
    let mut correlator = Correlator::new(
        PositionCache::load(position_path, now),
        PendingBuffer::load(pending_path, now),
        geocoder,
        record_tx,
        metrics,
        "test-ingester".into(),
    );
    correlator
        .handle_event(
            PacketEvent::Telemetry(wesense_mesh_ingest::model::TelemetryBatch {
                node: 0x5eed1234,
                region: "ANZ".into(),
                readings: vec![TelemetryReading {
                    reading_type: ReadingType::Humidity,
                    value: 71.0,
                    sensor_time: now + 30,
                }],
                received_at: now + 30,
            }),
            now + 30,
        )
        .await;
    let record = record_rx.try_recv().expect("restored cache must correlate");
    assert_eq!(record.device_id, "meshtastic_5eed1234");
    assert_eq!(record.value, 71.0);
    assert_eq!(record.position_age_seconds, 330);
}
