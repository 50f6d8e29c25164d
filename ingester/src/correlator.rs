//! The single-consumer junction of the pipeline.
//!
//! Owns the position cache and the pending buffer outright, so the hot path
//! is lock-free: a POSITION upserts the cache and drains that node's
//! buffered readings; a TELEMETRY either joins against a live cached
//! position or waits in the buffer. Geocoding on this thread is cache-only;
//! a miss emits the record as `unknown` and leaves resolution to the
//! background worker. The only awaits here are channel sends, which is how
//! backpressure reaches the subscribers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::geocode::ReverseGeocoder;
use crate::metrics::Metrics;
use crate::model::{
    self, EnrichedRecord, NodeInfoUpdate, PacketEvent, PositionUpdate, TelemetryBatch,
    TelemetryReading,
};
use crate::pending::PendingBuffer;
use crate::position::{CachedPosition, PositionCache, SWEEP_INTERVAL_SECS};

/// Out-of-band instructions from the supervisor (currently only the SIGHUP
/// snapshot).
#[derive(Clone, Copy, Debug)]
pub enum ControlMsg {
    SnapshotNow,
}

pub struct Correlator {
    positions: PositionCache,
    pending: PendingBuffer,
    geocoder: Arc<ReverseGeocoder>,
    record_tx: mpsc::Sender<EnrichedRecord>,
    metrics: Arc<Metrics>,
    ingestion_node_id: String,
}

impl Correlator {
    pub fn new(
        positions: PositionCache,
        pending: PendingBuffer,
        geocoder: Arc<ReverseGeocoder>,
        record_tx: mpsc::Sender<EnrichedRecord>,
        metrics: Arc<Metrics>,
        ingestion_node_id: String,
    ) -> Self {
        Self { positions, pending, geocoder, record_tx, metrics, ingestion_node_id }
    }

    pub async fn handle_event(&mut self, event: PacketEvent, now: i64) {
        match event {
            PacketEvent::Position(update) => self.handle_position(update, now).await,
            PacketEvent::Telemetry(batch) => self.handle_telemetry(batch, now).await,
            PacketEvent::NodeInfo(info) => self.handle_node_info(info, now),
        }
        self.refresh_gauges();
    }

    async fn handle_position(&mut self, update: PositionUpdate, now: i64) {
        self.metrics.positions.fetch_add(1, Ordering::Relaxed);
        self.positions.put(&update, now);
        info!(
            node = %model::device_id(update.node),
            region = update.region.as_str(),
            lat = update.latitude,
            lon = update.longitude,
            "position_broadcast",
        );

        let (drained, expired) = self.pending.drain(update.node, now);
        if expired > 0 {
            self.metrics.pending_expired.fetch_add(expired as u64, Ordering::Relaxed);
        }
        if drained.is_empty() {
            return;
        }
        info!(
            node = %model::device_id(update.node),
            region = update.region.as_str(),
            count = drained.len(),
            "position_arrived_draining_pending",
        );
        self.metrics.pending_drained.fetch_add(drained.len() as u64, Ordering::Relaxed);
        for buffered in drained {
            self.join_and_emit(update.node, &update.region, buffered.reading, now).await;
        }
    }

    async fn handle_telemetry(&mut self, batch: TelemetryBatch, now: i64) {
        let has_position = self.positions.get(batch.node, now).is_some();
        for reading in batch.readings {
            self.metrics.readings.fetch_add(1, Ordering::Relaxed);
            if has_position {
                self.join_and_emit(batch.node, &batch.region, reading, now).await;
            } else {
                let queued = self.pending.push(batch.node, reading, now);
                self.metrics.pending_buffered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    node = %model::device_id(batch.node),
                    region = batch.region.as_str(),
                    queued,
                    "waiting_for_position",
                );
            }
        }
    }

    fn handle_node_info(&mut self, info: NodeInfoUpdate, now: i64) {
        self.metrics.nodeinfo.fetch_add(1, Ordering::Relaxed);
        let applied = self.positions.apply_node_info(&info, now);
        debug!(
            node = %model::device_id(info.node),
            region = info.region.as_str(),
            applied,
            name = info.node_name.as_deref().unwrap_or(""),
            hardware = info.hardware_model.as_deref().unwrap_or(""),
            "node_info",
        );
    }

    async fn join_and_emit(
        &mut self,
        node: u32,
        region: &str,
        reading: TelemetryReading,
        now: i64,
    ) {
        self.positions.note_env_time(node, reading.sensor_time);
        let Some(position) = self.positions.get(node, now) else {
            // Position expired between the lookup and the join; requeue
            // would loop, so the reading is dropped.
            return;
        };
        let record = build_record(
            position,
            region,
            reading,
            &self.geocoder,
            &self.ingestion_node_id,
            now,
        );
        self.metrics.records_emitted.fetch_add(1, Ordering::Relaxed);
        // Blocks when the sink backs up; that is the backpressure path.
        let _ = self.record_tx.send(record).await;
    }

    fn refresh_gauges(&self) {
        self.metrics
            .position_cache_size
            .store(self.positions.len() as u64, Ordering::Relaxed);
        self.metrics
            .pending_nodes
            .store(self.pending.node_count() as u64, Ordering::Relaxed);
        self.metrics
            .pending_readings
            .store(self.pending.reading_count() as u64, Ordering::Relaxed);
    }

    fn sweep(&mut self, now: i64) {
        let positions = self.positions.sweep(now);
        let readings = self.pending.sweep(now);
        if positions > 0 || readings > 0 {
            self.metrics.pending_expired.fetch_add(readings as u64, Ordering::Relaxed);
            info!(positions, readings, "expiry_sweep");
        }
        self.metrics
            .active_nodes_last_hour
            .store(self.positions.active_last_hour(now) as u64, Ordering::Relaxed);
        self.refresh_gauges();
    }

    pub fn snapshot(&mut self, now: i64) {
        self.positions.snapshot(now);
        self.pending.snapshot(now);
    }
}

fn build_record(
    position: &CachedPosition,
    region: &str,
    reading: TelemetryReading,
    geocoder: &ReverseGeocoder,
    ingestion_node_id: &str,
    now: i64,
) -> EnrichedRecord {
    let codes = geocoder.lookup_or_request(position.latitude, position.longitude);
    EnrichedRecord {
        node: position.node,
        device_id: model::device_id(position.node),
        node_name: position.node_name.clone(),
        board_model: position.hardware_model.clone(),
        reading_type: reading.reading_type,
        value: reading.value,
        unit: reading.reading_type.unit(),
        sensor_time: reading.sensor_time,
        latitude: position.latitude,
        longitude: position.longitude,
        altitude: position.altitude,
        country: codes.country,
        subdivision: codes.subdivision,
        data_source: model::DATA_SOURCE,
        region: region.to_string(),
        ingestion_node_id: ingestion_node_id.to_string(),
        received_at: now,
        position_age_seconds: now - position.received_at,
    }
}

/// Run until every decode-stage sender is gone, then snapshot both caches
/// and exit. Sweeping and the snapshot interval ride the same ticker.
pub async fn run_correlator(
    mut correlator: Correlator,
    mut event_rx: mpsc::Receiver<PacketEvent>,
    mut ctl_rx: mpsc::Receiver<ControlMsg>,
) {
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            maybe = event_rx.recv() => match maybe {
                Some(event) => {
                    let now = chrono::Utc::now().timestamp();
                    correlator.handle_event(event, now).await;
                }
                None => break,
            },
            _ = sweep_tick.tick() => {
                correlator.sweep(chrono::Utc::now().timestamp());
            }
            Some(msg) = ctl_rx.recv() => match msg {
                ControlMsg::SnapshotNow => {
                    let now = chrono::Utc::now().timestamp();
                    correlator.snapshot(now);
                    info!("caches_snapshotted_on_request");
                }
            },
        }
    }
    correlator.snapshot(chrono::Utc::now().timestamp());
    info!("correlator_drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeoCodes, ResolveJob};
    use crate::model::ReadingType;

    struct Rig {
        correlator: Correlator,
        record_rx: mpsc::Receiver<EnrichedRecord>,
        _resolve_rx: mpsc::Receiver<ResolveJob>,
        geocoder: Arc<ReverseGeocoder>,
        metrics: Arc<Metrics>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (resolve_tx, resolve_rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());
        let geocoder = Arc::new(ReverseGeocoder::new(
            dir.path().join("geocoding_cache.json"),
            resolve_tx,
            metrics.clone(),
        ));
        let (record_tx, record_rx) = mpsc::channel(64);
        let correlator = Correlator::new(
            PositionCache::new(dir.path().join("position_cache.json"), 0),
            PendingBuffer::new(dir.path().join("pending_telemetry.json"), 0),
            geocoder.clone(),
            record_tx,
            metrics.clone(),
            "test-ingester".into(),
        );
        Rig { correlator, record_rx, _resolve_rx: resolve_rx, geocoder, metrics, _dir: dir }
    }

    fn position(node: u32, lat: f64, lon: f64, at: i64) -> PacketEvent {
        PacketEvent::Position(PositionUpdate {
            node,
            region: "ANZ".into(),
            latitude: lat,
            longitude: lon,
            altitude: None,
            received_at: at,
        })
    }

    fn telemetry(node: u32, rt: ReadingType, value: f64, sensor_time: i64) -> PacketEvent {
        PacketEvent::Telemetry(TelemetryBatch {
            node,
            region: "ANZ".into(),
            readings: vec![TelemetryReading { reading_type: rt, value, sensor_time }],
            received_at: sensor_time,
        })
    }

    #[tokio::test]
    async fn position_then_telemetry_emits_one_record() {
        let mut r = rig();
        r.geocoder.test_insert(
            -36.8485,
            174.7633,
            GeoCodes { country: "nz".into(), subdivision: "auk".into() },
            900,
        );
        r.correlator
            .handle_event(position(0xa1b2c3d4, -36.8485, 174.7633, 1000), 1000)
            .await;
        r.correlator
            .handle_event(telemetry(0xa1b2c3d4, ReadingType::Temperature, 22.5, 1060), 1060)
            .await;

        let record = r.record_rx.try_recv().unwrap();
        assert_eq!(record.device_id, "meshtastic_a1b2c3d4");
        assert_eq!(record.reading_type, ReadingType::Temperature);
        assert_eq!(record.value, 22.5);
        assert_eq!(record.sensor_time, 1060);
        assert_eq!(record.country, "nz");
        assert_eq!(record.subdivision, "auk");
        assert_eq!(record.position_age_seconds, 60);
        assert_eq!(record.data_source, "MESHTASTIC");
        assert!(r.record_rx.try_recv().is_err(), "exactly one record");
    }

    #[tokio::test]
    async fn telemetry_before_position_is_buffered_then_drained() {
        let mut r = rig();
        r.geocoder.test_insert(
            51.5074,
            -0.1278,
            GeoCodes { country: "gb".into(), subdivision: "eng".into() },
            900,
        );
        r.correlator
            .handle_event(telemetry(0xdeadbeef, ReadingType::Humidity, 65.0, 1000), 1000)
            .await;
        assert!(r.record_rx.try_recv().is_err(), "no position yet, no record");

        r.correlator
            .handle_event(position(0xdeadbeef, 51.5074, -0.1278, 1100), 1100)
            .await;
        let record = r.record_rx.try_recv().unwrap();
        assert_eq!(record.device_id, "meshtastic_deadbeef");
        assert_eq!(record.value, 65.0);
        // The buffered reading keeps its original sensor time.
        assert_eq!(record.sensor_time, 1000);
        assert_eq!(record.country, "gb");
        assert_eq!(record.subdivision, "eng");
    }

    #[tokio::test]
    async fn unknown_locality_emits_unknown_codes() {
        let mut r = rig();
        r.correlator.handle_event(position(0x42, 0.0, 0.0, 1000), 1000).await;
        r.correlator
            .handle_event(telemetry(0x42, ReadingType::Temperature, 25.0, 1010), 1010)
            .await;
        let record = r.record_rx.try_recv().unwrap();
        assert_eq!(record.country, "unknown");
        assert_eq!(record.subdivision, "unknown");
    }

    #[tokio::test]
    async fn expired_position_does_not_join() {
        let mut r = rig();
        r.correlator.handle_event(position(7, 1.0, 2.0, 0), 0).await;
        let later = crate::position::POSITION_TTL_SECS + 10;
        r.correlator
            .handle_event(telemetry(7, ReadingType::Temperature, 20.0, later), later)
            .await;
        assert!(r.record_rx.try_recv().is_err(), "expired position must not correlate");
    }

    #[tokio::test]
    async fn node_info_enriches_subsequent_records() {
        let mut r = rig();
        r.correlator.handle_event(position(9, 1.0, 2.0, 100), 100).await;
        r.correlator
            .handle_event(
                PacketEvent::NodeInfo(NodeInfoUpdate {
                    node: 9,
                    region: "ANZ".into(),
                    node_name: Some("WS-Rooftop".into()),
                    hardware_model: Some("LILYGO T-Beam".into()),
                }),
                110,
            )
            .await;
        r.correlator
            .handle_event(telemetry(9, ReadingType::Pressure, 1013.2, 120), 120)
            .await;
        let record = r.record_rx.try_recv().unwrap();
        assert_eq!(record.node_name.as_deref(), Some("WS-Rooftop"));
        assert_eq!(record.board_model.as_deref(), Some("LILYGO T-Beam"));
    }

    #[tokio::test]
    async fn sweep_publishes_hourly_active_gauge() {
        let mut r = rig();
        r.correlator.handle_event(position(1, 1.0, 2.0, 100), 100).await;
        r.correlator.handle_event(position(2, 3.0, 4.0, 100), 100).await;
        // Only node 1 reports a reading.
        r.correlator
            .handle_event(telemetry(1, ReadingType::Temperature, 20.0, 150), 150)
            .await;
        let _ = r.record_rx.try_recv();

        r.correlator.sweep(200);
        assert_eq!(r.metrics.active_nodes_last_hour.load(Ordering::Relaxed), 1);

        // An hour on, the reading has aged out of the window.
        r.correlator.sweep(150 + 3601);
        assert_eq!(r.metrics.active_nodes_last_hour.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn drained_readings_each_become_a_record() {
        let mut r = rig();
        for i in 0..3i64 {
            r.correlator
                .handle_event(
                    telemetry(5, ReadingType::Temperature, 20.0 + i as f64, 1000 + i),
                    1000 + i,
                )
                .await;
        }
        r.correlator.handle_event(position(5, 1.0, 2.0, 1100), 1100).await;
        let mut values = Vec::new();
        while let Ok(record) = r.record_rx.try_recv() {
            values.push(record.value);
        }
        assert_eq!(values, vec![20.0, 21.0, 22.0]);
    }
}
