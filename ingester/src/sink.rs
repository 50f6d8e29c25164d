//! Batched output: columnar writes plus MQTT republish.
//!
//! Records accumulate in a bounded batch and flush at BATCH_SIZE or on the
//! ticker, whichever comes first. A failed flush retries with exponential
//! backoff a bounded number of times, then the batch is dropped and
//! counted; the database never gets to wedge the pipeline. Republish is
//! per-record, QoS 0, fire-and-forget; its failures are logged and do not
//! touch the columnar path. The store dedupes on
//! `(device_id, reading_type, sensor_time)` downstream, so the sink makes
//! no transactional promises.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClickHouseConfig, OutputMqttConfig};
use crate::geocode::UNKNOWN;
use crate::metrics::Metrics;
use crate::model::EnrichedRecord;

const FLUSH_MAX_ATTEMPTS: u32 = 5;
const FLUSH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const FLUSH_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Republish topic: `wesense/v1/{country}/{subdivision}/{device_id}/{reading_type}`.
pub fn republish_topic(record: &EnrichedRecord) -> String {
    let country = if record.country.is_empty() { UNKNOWN } else { &record.country };
    let subdivision = if record.subdivision.is_empty() { UNKNOWN } else { &record.subdivision };
    format!(
        "wesense/v1/{}/{}/{}/{}",
        country, subdivision, record.device_id, record.reading_type
    )
}

pub fn republish_payload(record: &EnrichedRecord) -> serde_json::Value {
    json!({
        "value": record.value,
        "timestamp": record.sensor_time,
        "device_id": record.device_id,
        "latitude": record.latitude,
        "longitude": record.longitude,
        "country": record.country,
        "subdivision": record.subdivision,
        "unit": record.unit,
        "data_source": record.data_source,
        "board_model": record.board_model,
        "reading_type": record.reading_type,
    })
}

/// One columnar row in `JSONEachRow` form.
pub fn row_json(record: &EnrichedRecord) -> serde_json::Value {
    json!({
        "timestamp": record.sensor_time,
        "device_id": record.device_id,
        "node_name": record.node_name,
        "data_source": record.data_source,
        "network_source": record.region,
        "ingestion_node_id": record.ingestion_node_id,
        "reading_type": record.reading_type,
        "value": record.value,
        "unit": record.unit,
        "latitude": record.latitude,
        "longitude": record.longitude,
        "altitude": record.altitude,
        "country": record.country,
        "subdivision": record.subdivision,
        "board_model": record.board_model,
        "position_age_seconds": record.position_age_seconds,
    })
}

pub struct ClickHouseWriter {
    client: reqwest::Client,
    endpoint: String,
    insert_query: String,
    username: String,
    password: String,
}

impl ClickHouseWriter {
    pub fn new(cfg: &ClickHouseConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("http://{}:{}/", cfg.host, cfg.port),
            insert_query: format!(
                "INSERT INTO {}.{} FORMAT JSONEachRow",
                cfg.database, cfg.table
            ),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }
    }

    async fn insert(&self, batch: &[EnrichedRecord]) -> anyhow::Result<()> {
        let mut body = String::with_capacity(batch.len() * 256);
        for record in batch {
            let _ = writeln!(body, "{}", row_json(record));
        }
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("query", self.insert_query.as_str())])
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("clickhouse insert failed: {status}: {detail}");
        }
        Ok(())
    }
}

pub struct Republisher {
    client: AsyncClient,
}

impl Republisher {
    /// Builds the output client and spawns its event-loop driver. The driver
    /// only has to keep the connection alive; publish results surface as
    /// queue errors on the caller side.
    pub fn connect(cfg: &OutputMqttConfig, shutdown: CancellationToken) -> Self {
        let mut options = MqttOptions::new("wesense_mesh_publisher", cfg.broker.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        let (client, mut eventloop) = AsyncClient::new(options, 256);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            debug!(error = %e, "republish_connection_retrying");
                            tokio::time::sleep(Duration::from_secs(3)).await;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
        Self { client }
    }

    fn publish(&self, record: &EnrichedRecord, metrics: &Metrics) {
        let topic = republish_topic(record);
        let payload = republish_payload(record).to_string();
        match self.client.try_publish(&topic, QoS::AtMostOnce, false, payload) {
            Ok(()) => {
                metrics.republished.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                metrics.republish_failed.fetch_add(1, Ordering::Relaxed);
                debug!(topic = topic.as_str(), error = %e, "republish_failed");
            }
        }
    }
}

/// Sink worker: drains the record channel into the batch, republishes each
/// record as it arrives, and flushes on size or interval. Ends with a final
/// flush once the correlator hangs up.
pub async fn run_sink(
    mut record_rx: mpsc::Receiver<EnrichedRecord>,
    writer: Option<ClickHouseWriter>,
    republisher: Option<Republisher>,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Arc<Metrics>,
) {
    let mut batch: Vec<EnrichedRecord> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            maybe = record_rx.recv() => match maybe {
                Some(record) => {
                    if let Some(pub_client) = &republisher {
                        pub_client.publish(&record, &metrics);
                    }
                    batch.push(record);
                    if batch.len() >= batch_size {
                        flush(&writer, &mut batch, &metrics).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&writer, &mut batch, &metrics).await;
                }
            }
        }
    }
    if !batch.is_empty() {
        flush(&writer, &mut batch, &metrics).await;
    }
    info!("sink_drained");
}

/// Retry with exponential backoff up to the cap, then drop the batch. The
/// buffer never grows past one batch during retries because the caller
/// blocks on this future.
async fn flush(writer: &Option<ClickHouseWriter>, batch: &mut Vec<EnrichedRecord>, metrics: &Metrics) {
    let rows = batch.len();
    let Some(writer) = writer else {
        // MQTT-only deployment; the batch has already been republished.
        metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
        batch.clear();
        return;
    };
    for attempt in 0..FLUSH_MAX_ATTEMPTS {
        match writer.insert(batch).await {
            Ok(()) => {
                metrics.rows_written.fetch_add(rows as u64, Ordering::Relaxed);
                metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
                info!(rows, "batch_flushed");
                batch.clear();
                return;
            }
            Err(e) => {
                let delay = FLUSH_BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(FLUSH_BACKOFF_CAP);
                warn!(
                    rows,
                    attempt = attempt + 1,
                    max_attempts = FLUSH_MAX_ATTEMPTS,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "batch_flush_failed",
                );
                if attempt + 1 < FLUSH_MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
    warn!(rows, "batch_dropped_after_retries");
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReadingType, DATA_SOURCE};

    fn record(country: &str, subdivision: &str) -> EnrichedRecord {
        EnrichedRecord {
            node: 0xa1b2c3d4,
            device_id: "meshtastic_a1b2c3d4".into(),
            node_name: Some("WS-Rooftop".into()),
            board_model: Some("LILYGO T-Beam".into()),
            reading_type: ReadingType::Temperature,
            value: 22.5,
            unit: "°C",
            sensor_time: 1060,
            latitude: -36.8485,
            longitude: 174.7633,
            altitude: Some(30.0),
            country: country.into(),
            subdivision: subdivision.into(),
            data_source: DATA_SOURCE,
            region: "ANZ".into(),
            ingestion_node_id: "ingest-1".into(),
            received_at: 1061,
            position_age_seconds: 60,
        }
    }

    #[test]
    fn topic_uses_codes_and_reading_type() {
        let topic = republish_topic(&record("nz", "auk"));
        assert_eq!(topic, "wesense/v1/nz/auk/meshtastic_a1b2c3d4/temperature");
    }

    #[test]
    fn topic_falls_back_to_unknown() {
        let topic = republish_topic(&record("unknown", "unknown"));
        assert_eq!(
            topic,
            "wesense/v1/unknown/unknown/meshtastic_a1b2c3d4/temperature"
        );
        // Empty codes never produce empty topic levels.
        let topic = republish_topic(&record("", ""));
        assert_eq!(
            topic,
            "wesense/v1/unknown/unknown/meshtastic_a1b2c3d4/temperature"
        );
    }

    #[test]
    fn republish_payload_shape() {
        let payload = republish_payload(&record("nz", "auk"));
        assert_eq!(payload["value"], 22.5);
        assert_eq!(payload["timestamp"], 1060);
        assert_eq!(payload["device_id"], "meshtastic_a1b2c3d4");
        assert_eq!(payload["country"], "nz");
        assert_eq!(payload["subdivision"], "auk");
        assert_eq!(payload["unit"], "°C");
        assert_eq!(payload["data_source"], "MESHTASTIC");
        assert_eq!(payload["board_model"], "LILYGO T-Beam");
        assert_eq!(payload["reading_type"], "temperature");
    }

    #[test]
    fn row_json_covers_columnar_schema() {
        let row = row_json(&record("nz", "auk"));
        for column in [
            "timestamp",
            "device_id",
            "node_name",
            "data_source",
            "board_model",
            "reading_type",
            "value",
            "unit",
            "latitude",
            "longitude",
            "altitude",
            "country",
            "subdivision",
            "ingestion_node_id",
        ] {
            assert!(row.get(column).is_some(), "missing column {column}");
        }
        assert_eq!(row["network_source"], "ANZ");
        assert_eq!(row["reading_type"], "temperature");
    }

    #[tokio::test]
    async fn batch_flushes_exactly_at_size() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_sink(
            rx,
            None,
            None,
            3,
            Duration::from_secs(3600),
            metrics.clone(),
        ));
        for _ in 0..3 {
            tx.send(record("nz", "auk")).await.unwrap();
        }
        // The third record fills the batch; no ticker needed.
        for _ in 0..100 {
            if metrics.batches_flushed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.batches_flushed.load(Ordering::Relaxed), 1);
        drop(tx);
        handle.await.unwrap();
        // Channel closed with an empty buffer: no extra flush.
        assert_eq!(metrics.batches_flushed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn final_flush_on_close() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_sink(
            rx,
            None,
            None,
            100,
            Duration::from_secs(3600),
            metrics.clone(),
        ));
        tx.send(record("gb", "eng")).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(metrics.batches_flushed.load(Ordering::Relaxed), 1);
    }
}
