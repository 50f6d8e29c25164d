//! Pending telemetry buffer.
//!
//! A node often broadcasts telemetry for many minutes before its first
//! position beacon; dropping on cache miss would lose the opening data of
//! every newly joined sensor. Readings wait here until a position arrives,
//! bounded per node and globally, and expire after one hour regardless.
//! Owned exclusively by the correlator. Snapshot discipline matches the
//! position cache, to a separate file; the timestamp guard and the age
//! filter are re-applied when the snapshot is rehydrated.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::guard;
use crate::model::TelemetryReading;
use crate::snapshot;

pub const PENDING_TTL_SECS: i64 = 3600;
pub const PER_NODE_CAP: usize = 50;
pub const GLOBAL_NODE_CAP: usize = 10_000;
const SNAPSHOT_EVERY_UPDATES: u32 = 100;
const SNAPSHOT_EVERY_SECS: i64 = 300;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedReading {
    #[serde(flatten)]
    pub reading: TelemetryReading,
    pub enqueued_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeQueue {
    readings: VecDeque<BufferedReading>,
    /// Monotonic touch sequence for global LRU eviction.
    touched: u64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    saved_at: i64,
    pending: HashMap<String, NodeQueue>,
}

pub struct PendingBuffer {
    nodes: HashMap<u32, NodeQueue>,
    seq: u64,
    path: PathBuf,
    updates_since_snapshot: u32,
    last_snapshot_at: i64,
}

impl PendingBuffer {
    pub fn new(path: PathBuf, now: i64) -> Self {
        Self {
            nodes: HashMap::new(),
            seq: 0,
            path,
            updates_since_snapshot: 0,
            last_snapshot_at: now,
        }
    }

    /// Rehydrate from disk, discarding readings that are expired or
    /// future-dated at load time.
    pub fn load(path: PathBuf, now: i64) -> Self {
        let mut buf = Self::new(path, now);
        match snapshot::load_json::<SnapshotFile>(&buf.path) {
            Ok(Some(file)) => {
                let mut kept = 0usize;
                let mut dropped = 0usize;
                for (key, mut queue) in file.pending {
                    let Ok(node) = u32::from_str_radix(&key, 16) else {
                        dropped += queue.readings.len();
                        continue;
                    };
                    let before = queue.readings.len();
                    queue.readings.retain(|r| {
                        now - r.enqueued_at < PENDING_TTL_SECS
                            && guard::future_delta(r.reading.sensor_time, now).is_none()
                    });
                    dropped += before - queue.readings.len();
                    kept += queue.readings.len();
                    if !queue.readings.is_empty() {
                        buf.seq = buf.seq.max(queue.touched + 1);
                        buf.nodes.insert(node, queue);
                    }
                }
                info!(
                    path = %buf.path.display(),
                    age_secs = now - file.saved_at,
                    nodes = buf.nodes.len(),
                    readings = kept,
                    discarded = dropped,
                    "pending_telemetry_loaded",
                );
            }
            Ok(None) => {}
            Err(e) => warn!(path = %buf.path.display(), error = %e, "pending_telemetry_load_failed"),
        }
        buf
    }

    /// Queue a reading for a node with no usable position yet. Returns the
    /// node's queue length after the push.
    pub fn push(&mut self, node: u32, reading: TelemetryReading, now: i64) -> usize {
        self.seq += 1;
        let seq = self.seq;
        if !self.nodes.contains_key(&node) && self.nodes.len() >= GLOBAL_NODE_CAP {
            self.evict_lru();
        }
        let queue = self.nodes.entry(node).or_insert_with(|| NodeQueue {
            readings: VecDeque::new(),
            touched: seq,
        });
        queue.touched = seq;
        if queue.readings.len() >= PER_NODE_CAP {
            queue.readings.pop_front();
        }
        queue.readings.push_back(BufferedReading { reading, enqueued_at: now });
        self.updates_since_snapshot += 1;
        let len = queue.readings.len();
        self.maybe_snapshot(now);
        len
    }

    /// Remove and return everything buffered for a node, dropping readings
    /// that expired or turned out future-dated while waiting. Called when
    /// the node's position arrives.
    pub fn drain(&mut self, node: u32, now: i64) -> (Vec<BufferedReading>, usize) {
        let Some(queue) = self.nodes.remove(&node) else {
            return (Vec::new(), 0);
        };
        let total = queue.readings.len();
        let valid: Vec<BufferedReading> = queue
            .readings
            .into_iter()
            .filter(|r| {
                now - r.enqueued_at < PENDING_TTL_SECS
                    && guard::future_delta(r.reading.sensor_time, now).is_none()
            })
            .collect();
        let expired = total - valid.len();
        if !valid.is_empty() || expired > 0 {
            self.updates_since_snapshot += 1;
            self.maybe_snapshot(now);
        }
        (valid, expired)
    }

    /// Drop whole readings past the TTL; empty queues go with them.
    pub fn sweep(&mut self, now: i64) -> usize {
        let mut removed = 0;
        self.nodes.retain(|_, q| {
            let before = q.readings.len();
            q.readings.retain(|r| now - r.enqueued_at < PENDING_TTL_SECS);
            removed += before - q.readings.len();
            !q.readings.is_empty()
        });
        removed
    }

    fn evict_lru(&mut self) {
        if let Some((&node, _)) = self.nodes.iter().min_by_key(|(_, q)| q.touched) {
            self.nodes.remove(&node);
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn reading_count(&self) -> usize {
        self.nodes.values().map(|q| q.readings.len()).sum()
    }

    fn maybe_snapshot(&mut self, now: i64) {
        if self.updates_since_snapshot >= SNAPSHOT_EVERY_UPDATES
            || now - self.last_snapshot_at >= SNAPSHOT_EVERY_SECS
        {
            self.snapshot(now);
        }
    }

    pub fn snapshot(&mut self, now: i64) {
        let file = SnapshotFile {
            saved_at: now,
            pending: self
                .nodes
                .iter()
                .map(|(node, q)| (format!("{node:08x}"), q.clone()))
                .collect(),
        };
        if let Err(e) = snapshot::write_json_atomic(&self.path, &file) {
            warn!(path = %self.path.display(), error = %e, "pending_telemetry_snapshot_failed");
        }
        self.updates_since_snapshot = 0;
        self.last_snapshot_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadingType;

    fn reading(rt: ReadingType, value: f64, sensor_time: i64) -> TelemetryReading {
        TelemetryReading { reading_type: rt, value, sensor_time }
    }

    fn buffer(now: i64) -> (tempfile::TempDir, PendingBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buf = PendingBuffer::new(dir.path().join("pending_telemetry.json"), now);
        (dir, buf)
    }

    #[test]
    fn push_then_drain_in_order() {
        let (_dir, mut b) = buffer(0);
        b.push(1, reading(ReadingType::Humidity, 65.0, 100), 100);
        b.push(1, reading(ReadingType::Humidity, 66.0, 160), 160);
        let (drained, expired) = b.drain(1, 200);
        assert_eq!(expired, 0);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].reading.value, 65.0);
        assert_eq!(drained[1].reading.value, 66.0);
        assert_eq!(b.node_count(), 0);
    }

    #[test]
    fn per_node_cap_evicts_oldest() {
        let (_dir, mut b) = buffer(0);
        for i in 0..(PER_NODE_CAP + 1) {
            b.push(1, reading(ReadingType::Temperature, i as f64, 100 + i as i64), 100);
        }
        let (drained, _) = b.drain(1, 150);
        assert_eq!(drained.len(), PER_NODE_CAP);
        // Reading 0 was evicted by the cap.
        assert_eq!(drained[0].reading.value, 1.0);
    }

    #[test]
    fn readings_expire_after_one_hour() {
        let (_dir, mut b) = buffer(0);
        b.push(1, reading(ReadingType::Temperature, 20.0, 100), 100);
        b.push(1, reading(ReadingType::Temperature, 21.0, 2000), 2000);
        // At t=100+3600 the first reading is exactly at TTL: expired.
        let (drained, expired) = b.drain(1, 100 + PENDING_TTL_SECS);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reading.value, 21.0);
        assert_eq!(expired, 1);
    }

    #[test]
    fn sweep_drops_expired_and_empty_nodes() {
        let (_dir, mut b) = buffer(0);
        b.push(1, reading(ReadingType::Temperature, 20.0, 100), 100);
        b.push(2, reading(ReadingType::Pressure, 1013.0, 3000), 3000);
        let removed = b.sweep(100 + PENDING_TTL_SECS);
        assert_eq!(removed, 1);
        assert_eq!(b.node_count(), 1);
        assert_eq!(b.reading_count(), 1);
    }

    #[test]
    fn global_cap_evicts_least_recently_touched_node() {
        let (_dir, mut b) = buffer(0);
        for node in 0..GLOBAL_NODE_CAP as u32 {
            b.push(node, reading(ReadingType::Temperature, 1.0, 100), 100);
        }
        // Touch node 0 so node 1 becomes the LRU.
        b.push(0, reading(ReadingType::Temperature, 2.0, 101), 101);
        b.push(u32::MAX, reading(ReadingType::Temperature, 3.0, 102), 102);
        assert_eq!(b.node_count(), GLOBAL_NODE_CAP);
        assert!(b.drain(1, 110).0.is_empty(), "LRU node should be gone");
        assert_eq!(b.drain(0, 110).0.len(), 2);
    }

    #[test]
    fn snapshot_roundtrip_applies_guard_and_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_telemetry.json");
        let mut b = PendingBuffer::new(path.clone(), 0);
        b.push(1, reading(ReadingType::Humidity, 65.0, 1000), 1000);
        b.push(1, reading(ReadingType::Humidity, 66.0, 9_999_999), 1000); // future-dated
        b.push(2, reading(ReadingType::Temperature, 20.0, 900), 900);
        b.snapshot(1000);

        // Restart shortly after: future-dated reading is discarded at load.
        let mut restored = PendingBuffer::load(path.clone(), 1100);
        assert_eq!(restored.node_count(), 2);
        let (drained, _) = restored.drain(1, 1100);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reading.value, 65.0);

        // Restart an hour later: everything aged out.
        let restored = PendingBuffer::load(path, 1000 + PENDING_TTL_SECS);
        assert_eq!(restored.node_count(), 0);
    }
}
