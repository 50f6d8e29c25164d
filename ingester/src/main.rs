// =============================================================================
// WESENSE MESH INGEST — Meshtastic MQTT Telemetry Ingester
// =============================================================================
// Pipeline: regional subscribers -> decode (AES-CTR + protobuf + dedup +
// timestamp guard) -> correlator (position cache + pending buffer) ->
// geocoder -> batched sink (ClickHouse + republish MQTT).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wesense_mesh_ingest::config::Config;
use wesense_mesh_ingest::correlator::{run_correlator, ControlMsg, Correlator};
use wesense_mesh_ingest::decode::{derive_channel_key, run_decoder, Decoder};
use wesense_mesh_ingest::dedup::{DedupFilter, DEDUP_CAPACITY, DEDUP_TTL_SECS};
use wesense_mesh_ingest::geocode::gazetteer::Gazetteer;
use wesense_mesh_ingest::geocode::nominatim::NominatimClient;
use wesense_mesh_ingest::geocode::{run_resolver, ReverseGeocoder};
use wesense_mesh_ingest::logging::{self, run_future_timestamp_log, SizeRotatingLog};
use wesense_mesh_ingest::metrics::{run_stats, Metrics};
use wesense_mesh_ingest::pending::PendingBuffer;
use wesense_mesh_ingest::position::PositionCache;
use wesense_mesh_ingest::sink::{run_sink, ClickHouseWriter, Republisher};
use wesense_mesh_ingest::subscriber::run_region;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

// Channel capacities: wide at the edge to absorb mesh bursts, moderate
// inside so backpressure reaches the subscribers instead of the heap.
const RAW_CHANNEL_CAPACITY: usize = 65_536;
const EVENT_CHANNEL_CAPACITY: usize = 8_192;
const RECORD_CHANNEL_CAPACITY: usize = 8_192;
const RESOLVE_CHANNEL_CAPACITY: usize = 512;
const FT_LOG_CHANNEL_CAPACITY: usize = 1_024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init(&config);

    let key_preview: String = config.channel_key_b64.chars().take(8).collect();
    info!(
        mode = ?config.mode,
        ingestion_node_id = config.ingestion_node_id.as_str(),
        regions = config.regions.len(),
        enabled = config.enabled_regions().count(),
        channel_key = format!("{key_preview}...").as_str(),
        timezone = config.timezone.as_deref().unwrap_or("UTC"),
        "wesense mesh ingester starting",
    );

    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();
    let now = chrono::Utc::now().timestamp();

    let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let (resolve_tx, resolve_rx) = mpsc::channel(RESOLVE_CHANNEL_CAPACITY);
    let (ft_tx, ft_rx) = mpsc::channel(FT_LOG_CHANNEL_CAPACITY);
    let (ctl_tx, ctl_rx) = mpsc::channel(4);

    // Geocoder: L1 cache + background resolver (gazetteer, then online).
    let geocoder = Arc::new(ReverseGeocoder::new(
        config.geocoding_cache_path(),
        resolve_tx,
        metrics.clone(),
    ));
    let gazetteer = match &config.geocoder.gazetteer_path {
        Some(path) => Gazetteer::from_csv(path)?,
        None => Gazetteer::builtin(),
    };
    info!(places = gazetteer.len(), online = config.geocoder.online, "geocoder_ready");
    let online = config.geocoder.online.then(|| {
        NominatimClient::new(
            config.geocoder.nominatim_url.clone(),
            config.geocoder.user_agent.clone(),
        )
    });
    let resolver_handle = tokio::spawn(run_resolver(
        geocoder.clone(),
        resolve_rx,
        Some(gazetteer),
        online,
        shutdown.clone(),
    ));

    // Dedicated stream for timestamp-guard rejections.
    let ft_log = SizeRotatingLog::new(
        config.log_dir.join("future_timestamps.log"),
        config.log_max_bytes,
        config.log_backup_count,
    );
    let ft_handle = tokio::spawn(run_future_timestamp_log(ft_rx, ft_log));

    // Decode stage: decrypt, parse, dedup, guard.
    let decoder = Decoder::new(derive_channel_key(&config.channel_key_b64), metrics.clone());
    let dedup = DedupFilter::new(DEDUP_TTL_SECS, DEDUP_CAPACITY);
    let decode_handle = tokio::spawn(run_decoder(
        decoder,
        dedup,
        raw_rx,
        event_tx,
        ft_tx,
        metrics.clone(),
    ));

    // Correlator: owns both caches, restored from disk.
    let positions = PositionCache::load(config.position_cache_path(), now);
    let pending = PendingBuffer::load(config.pending_telemetry_path(), now);
    let correlator = Correlator::new(
        positions,
        pending,
        geocoder.clone(),
        record_tx,
        metrics.clone(),
        config.ingestion_node_id.clone(),
    );
    let correlator_handle = tokio::spawn(run_correlator(correlator, event_rx, ctl_rx));

    // Sink: columnar writer and republisher are both optional.
    let writer = match &config.clickhouse {
        Some(ch) => {
            info!(host = ch.host.as_str(), port = ch.port, table = ch.table.as_str(), "columnar_sink_configured");
            Some(ClickHouseWriter::new(ch))
        }
        None => {
            info!("no columnar store configured, republish only");
            None
        }
    };
    let republisher = config
        .output
        .as_ref()
        .map(|o| Republisher::connect(o, shutdown.clone()));
    if republisher.is_none() {
        info!("no output broker configured, republish disabled");
    }
    let sink_handle = tokio::spawn(run_sink(
        record_rx,
        writer,
        republisher,
        config.batch_size,
        config.flush_interval,
        metrics.clone(),
    ));

    // Regional subscriber fleet.
    let mut subscriber_handles = Vec::new();
    for (tag, region_cfg) in config.enabled_regions() {
        subscriber_handles.push(tokio::spawn(run_region(
            tag.clone(),
            region_cfg.clone(),
            raw_tx.clone(),
            metrics.clone(),
            shutdown.clone(),
        )));
    }
    // The decode stage must see the channel close once subscribers stop.
    drop(raw_tx);

    let stats_handle = tokio::spawn(run_stats(
        metrics.clone(),
        config.stats_interval_secs,
        shutdown.clone(),
    ));

    wait_for_shutdown_signal(ctl_tx).await?;
    info!("shutdown requested");
    shutdown.cancel();

    // Drain in dependency order: subscribers hang up, decode drains, the
    // correlator snapshots, the sink flushes, the resolver persists its
    // cache. Past the deadline the state on disk is whatever the last
    // periodic snapshot saved.
    let drain = async {
        for handle in subscriber_handles {
            let _ = handle.await;
        }
        let _ = decode_handle.await;
        let _ = correlator_handle.await;
        let _ = sink_handle.await;
        let _ = resolver_handle.await;
        let _ = ft_handle.await;
        let _ = stats_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!(
            deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
            "graceful shutdown deadline exceeded",
        );
    }
    geocoder.snapshot_if_dirty();
    info!("shutdown complete");
    Ok(())
}

/// Blocks until SIGINT or SIGTERM. SIGHUP snapshots the caches without
/// exiting.
async fn wait_for_shutdown_signal(ctl_tx: mpsc::Sender<ControlMsg>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => return Ok(()),
            _ = sigterm.recv() => return Ok(()),
            _ = sighup.recv() => {
                info!("sighup_received_snapshotting_caches");
                let _ = ctl_tx.send(ControlMsg::SnapshotNow).await;
            }
        }
    }
}
