//! Per-node last-known position cache.
//!
//! Owned exclusively by the correlator; no locking. Entries expire seven
//! days after the position was received (checked on access and on the
//! periodic sweep) and the whole map is snapshotted to a single JSON file:
//! on graceful shutdown, and every N updates or T seconds, whichever comes
//! first. Write-through persistence was rejected for cost.
//!
//! NODEINFO arriving before a node's first position is held as a patch and
//! folded in when the position shows up; a patch never creates an entry on
//! its own.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{NodeInfoUpdate, PositionUpdate};
use crate::snapshot;

pub const POSITION_TTL_SECS: i64 = 7 * 24 * 3600;
pub const SWEEP_INTERVAL_SECS: u64 = 300;
/// Window for the "nodes active in the last hour" stat.
const ACTIVE_WINDOW_SECS: i64 = 3600;
const SNAPSHOT_EVERY_UPDATES: u32 = 100;
const SNAPSHOT_EVERY_SECS: i64 = 300;
const PENDING_INFO_CAP: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedPosition {
    pub node: u32,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    pub received_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_env_time: Option<i64>,
}

#[derive(Clone, Debug, Default)]
struct InfoPatch {
    node_name: Option<String>,
    hardware_model: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    saved_at: i64,
    nodes: Vec<CachedPosition>,
}

pub struct PositionCache {
    nodes: HashMap<u32, CachedPosition>,
    pending_info: HashMap<u32, InfoPatch>,
    pending_info_order: VecDeque<u32>,
    path: PathBuf,
    updates_since_snapshot: u32,
    last_snapshot_at: i64,
}

impl PositionCache {
    pub fn new(path: PathBuf, now: i64) -> Self {
        Self {
            nodes: HashMap::new(),
            pending_info: HashMap::new(),
            pending_info_order: VecDeque::new(),
            path,
            updates_since_snapshot: 0,
            last_snapshot_at: now,
        }
    }

    /// Load the snapshot, discarding entries already past the TTL in one
    /// pass. A corrupt snapshot starts empty with a warning.
    pub fn load(path: PathBuf, now: i64) -> Self {
        let mut cache = Self::new(path, now);
        match snapshot::load_json::<SnapshotFile>(&cache.path) {
            Ok(Some(file)) => {
                let total = file.nodes.len();
                cache.nodes = file
                    .nodes
                    .into_iter()
                    .filter(|p| now - p.received_at < POSITION_TTL_SECS)
                    .map(|p| (p.node, p))
                    .collect();
                info!(
                    path = %cache.path.display(),
                    age_secs = now - file.saved_at,
                    loaded = cache.nodes.len(),
                    expired = total - cache.nodes.len(),
                    "position_cache_loaded",
                );
            }
            Ok(None) => {}
            Err(e) => warn!(path = %cache.path.display(), error = %e, "position_cache_load_failed"),
        }
        cache
    }

    /// Upsert from a POSITION broadcast, preserving identity metadata and
    /// the last environmental-reading marker, and folding in any pending
    /// node-info patch.
    pub fn put(&mut self, update: &PositionUpdate, now: i64) {
        let patch = self.take_patch(update.node);
        let existing = self.nodes.remove(&update.node);
        let (node_name, hardware_model, last_env_time) = match existing {
            Some(prev) => (
                prev.node_name.or(patch.node_name),
                prev.hardware_model.or(patch.hardware_model),
                prev.last_env_time,
            ),
            None => (patch.node_name, patch.hardware_model, None),
        };
        self.nodes.insert(
            update.node,
            CachedPosition {
                node: update.node,
                latitude: update.latitude,
                longitude: update.longitude,
                altitude: update.altitude,
                node_name,
                hardware_model,
                received_at: update.received_at,
                last_env_time,
            },
        );
        self.updates_since_snapshot += 1;
        self.maybe_snapshot(now);
    }

    /// Last known position, or None on miss or expiry. Expired entries are
    /// dropped on access.
    pub fn get(&mut self, node: u32, now: i64) -> Option<&CachedPosition> {
        if let Some(p) = self.nodes.get(&node) {
            if now - p.received_at >= POSITION_TTL_SECS {
                self.nodes.remove(&node);
                return None;
            }
        }
        self.nodes.get(&node)
    }

    /// Record the newest environmental reading time for a node, used by the
    /// hourly-active stats.
    pub fn note_env_time(&mut self, node: u32, sensor_time: i64) {
        if let Some(p) = self.nodes.get_mut(&node) {
            if p.last_env_time.map_or(true, |t| sensor_time > t) {
                p.last_env_time = Some(sensor_time);
            }
        }
    }

    /// Apply a NODEINFO broadcast. Updates the cached position when one
    /// exists; otherwise holds the fields as a bounded patch. Never creates
    /// a position.
    pub fn apply_node_info(&mut self, info: &NodeInfoUpdate, now: i64) -> bool {
        if info.node_name.is_none() && info.hardware_model.is_none() {
            return false;
        }
        if let Some(p) = self.nodes.get_mut(&info.node) {
            if let Some(name) = &info.node_name {
                p.node_name = Some(name.clone());
            }
            if let Some(hw) = &info.hardware_model {
                p.hardware_model = Some(hw.clone());
            }
            self.updates_since_snapshot += 1;
            self.maybe_snapshot(now);
            return true;
        }
        if !self.pending_info.contains_key(&info.node) {
            if self.pending_info.len() >= PENDING_INFO_CAP {
                if let Some(oldest) = self.pending_info_order.pop_front() {
                    self.pending_info.remove(&oldest);
                }
            }
            self.pending_info_order.push_back(info.node);
        }
        let patch = self.pending_info.entry(info.node).or_default();
        if let Some(name) = &info.node_name {
            patch.node_name = Some(name.clone());
        }
        if let Some(hw) = &info.hardware_model {
            patch.hardware_model = Some(hw.clone());
        }
        false
    }

    fn take_patch(&mut self, node: u32) -> InfoPatch {
        match self.pending_info.remove(&node) {
            Some(patch) => {
                self.pending_info_order.retain(|&n| n != node);
                patch
            }
            None => InfoPatch::default(),
        }
    }

    /// Nodes with both a live position and an environmental reading inside
    /// the last hour. Future-dated markers do not count.
    pub fn active_last_hour(&self, now: i64) -> usize {
        self.nodes
            .values()
            .filter(|p| now - p.received_at < POSITION_TTL_SECS)
            .filter_map(|p| p.last_env_time)
            .filter(|&t| {
                let age = now - t;
                (0..=ACTIVE_WINDOW_SECS).contains(&age)
            })
            .count()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, p| now - p.received_at < POSITION_TTL_SECS);
        before - self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn maybe_snapshot(&mut self, now: i64) {
        if self.updates_since_snapshot >= SNAPSHOT_EVERY_UPDATES
            || now - self.last_snapshot_at >= SNAPSHOT_EVERY_SECS
        {
            self.snapshot(now);
        }
    }

    /// Unconditional snapshot; called on shutdown, SIGHUP, and by the
    /// update/interval policy.
    pub fn snapshot(&mut self, now: i64) {
        let file = SnapshotFile {
            saved_at: now,
            nodes: self.nodes.values().cloned().collect(),
        };
        if let Err(e) = snapshot::write_json_atomic(&self.path, &file) {
            warn!(path = %self.path.display(), error = %e, "position_cache_snapshot_failed");
        }
        self.updates_since_snapshot = 0;
        self.last_snapshot_at = now;
    }
}
