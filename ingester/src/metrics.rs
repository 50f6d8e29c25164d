//! Structured observability counters for all accept/drop paths, plus the
//! periodic stats summary. Steady-state faults are visible here and in the
//! logs only; nothing in the pipeline surfaces an error upward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
pub struct RegionCounters {
    pub messages: AtomicU64,
    pub reconnects: AtomicU64,
    pub positions: AtomicU64,
    pub environmental: AtomicU64,
}

pub struct Metrics {
    // Intake
    pub messages: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub decode_failed: AtomicU64,
    pub unsupported: AtomicU64,
    pub deduped: AtomicU64,
    pub future_dropped: AtomicU64,
    pub no_timestamp: AtomicU64,
    pub device_metrics_dropped: AtomicU64,
    // Correlation
    pub positions: AtomicU64,
    pub nodeinfo: AtomicU64,
    pub readings: AtomicU64,
    pub pending_buffered: AtomicU64,
    pub pending_drained: AtomicU64,
    pub pending_expired: AtomicU64,
    pub records_emitted: AtomicU64,
    // Geocoding
    pub geocode_hits: AtomicU64,
    pub geocode_misses: AtomicU64,
    pub geocode_resolved: AtomicU64,
    pub geocode_failed: AtomicU64,
    // Sink
    pub rows_written: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub republished: AtomicU64,
    pub republish_failed: AtomicU64,
    // Gauges, refreshed by the owning workers
    pub active_nodes_last_hour: AtomicU64,
    pub position_cache_size: AtomicU64,
    pub pending_nodes: AtomicU64,
    pub pending_readings: AtomicU64,
    pub dedup_size: AtomicU64,
    pub geocache_size: AtomicU64,

    pub regions: DashMap<String, RegionCounters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            decrypt_failed: AtomicU64::new(0),
            decode_failed: AtomicU64::new(0),
            unsupported: AtomicU64::new(0),
            deduped: AtomicU64::new(0),
            future_dropped: AtomicU64::new(0),
            no_timestamp: AtomicU64::new(0),
            device_metrics_dropped: AtomicU64::new(0),
            positions: AtomicU64::new(0),
            nodeinfo: AtomicU64::new(0),
            readings: AtomicU64::new(0),
            pending_buffered: AtomicU64::new(0),
            pending_drained: AtomicU64::new(0),
            pending_expired: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
            geocode_hits: AtomicU64::new(0),
            geocode_misses: AtomicU64::new(0),
            geocode_resolved: AtomicU64::new(0),
            geocode_failed: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            republished: AtomicU64::new(0),
            republish_failed: AtomicU64::new(0),
            active_nodes_last_hour: AtomicU64::new(0),
            position_cache_size: AtomicU64::new(0),
            pending_nodes: AtomicU64::new(0),
            pending_readings: AtomicU64::new(0),
            dedup_size: AtomicU64::new(0),
            geocache_size: AtomicU64::new(0),
            regions: DashMap::new(),
        }
    }

    pub fn region(&self, tag: &str) -> dashmap::mapref::one::Ref<'_, String, RegionCounters> {
        if let Some(r) = self.regions.get(tag) {
            return r;
        }
        self.regions.entry(tag.to_string()).or_default().downgrade()
    }
}

/// Periodic one-line summaries, per region and global, through tracing so
/// they land in the same stream as everything else.
pub async fn run_stats(metrics: Arc<Metrics>, interval_secs: u64, shutdown: CancellationToken) {
    let mut iv = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = iv.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        for entry in metrics.regions.iter() {
            info!(
                region = entry.key().as_str(),
                messages = entry.value().messages.load(Ordering::Relaxed),
                reconnects = entry.value().reconnects.load(Ordering::Relaxed),
                positions = entry.value().positions.load(Ordering::Relaxed),
                environmental = entry.value().environmental.load(Ordering::Relaxed),
                "region_stats",
            );
        }
        let deduped = metrics.deduped.load(Ordering::Relaxed);
        let unique = metrics.readings.load(Ordering::Relaxed);
        let total = deduped + unique;
        let block_rate = if total > 0 {
            deduped as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        info!(
            messages = metrics.messages.load(Ordering::Relaxed),
            deduped,
            block_rate = format!("{block_rate:.1}%").as_str(),
            records = metrics.records_emitted.load(Ordering::Relaxed),
            rows_written = metrics.rows_written.load(Ordering::Relaxed),
            batches_dropped = metrics.batches_dropped.load(Ordering::Relaxed),
            active_nodes_last_hour = metrics.active_nodes_last_hour.load(Ordering::Relaxed),
            position_cache = metrics.position_cache_size.load(Ordering::Relaxed),
            pending_nodes = metrics.pending_nodes.load(Ordering::Relaxed),
            pending_readings = metrics.pending_readings.load(Ordering::Relaxed),
            geocache = metrics.geocache_size.load(Ordering::Relaxed),
            future_dropped = metrics.future_dropped.load(Ordering::Relaxed),
            "ingest_stats",
        );
    }
}
