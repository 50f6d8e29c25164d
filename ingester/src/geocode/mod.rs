//! Two-layer reverse geocoding.
//!
//! The correlator path is cache-only: an L1 hit (keyed on coordinates
//! rounded to three decimals, roughly 100 m) resolves synchronously; a miss
//! yields `unknown`/`unknown` for that record and enqueues a resolve job.
//! The background worker answers from the offline gazetteer first and falls
//! back to the rate-limited online service, then stores the codes in L1 so
//! subsequent readings from the same locality resolve synchronously.
//! Records already emitted as `unknown` are not rewritten.
//!
//! The L1 map is shared between the correlator (reads) and the worker
//! (writes); dashmap keeps every lock scoped to a single entry and no lock
//! is ever held across I/O. The cache is persisted as JSON with the same
//! atomic-write discipline as the other snapshots.

pub mod gazetteer;
pub mod iso3166;
pub mod nominatim;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::snapshot;
use gazetteer::Gazetteer;
use nominatim::NominatimClient;

pub const UNKNOWN: &str = "unknown";

/// Resolved lowercase ISO codes for one rounded locality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoCodes {
    pub country: String,
    pub subdivision: String,
}

impl GeoCodes {
    pub fn unknown() -> Self {
        Self { country: UNKNOWN.into(), subdivision: UNKNOWN.into() }
    }

    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN && self.subdivision == UNKNOWN
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    country: String,
    subdivision: String,
    resolved_at: i64,
}

#[derive(Clone, Debug)]
pub struct ResolveJob {
    pub key: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Round to the cache key. Three decimals collapse near-identical fixes
/// into one lookup.
pub fn round_key(lat: f64, lon: f64) -> String {
    format!("{lat:.3},{lon:.3}")
}

pub struct ReverseGeocoder {
    l1: DashMap<String, CacheEntry>,
    inflight: DashMap<String, ()>,
    resolve_tx: mpsc::Sender<ResolveJob>,
    path: PathBuf,
    dirty: AtomicBool,
    metrics: Arc<Metrics>,
}

impl ReverseGeocoder {
    pub fn new(
        path: PathBuf,
        resolve_tx: mpsc::Sender<ResolveJob>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let geocoder = Self {
            l1: DashMap::new(),
            inflight: DashMap::new(),
            resolve_tx,
            path,
            dirty: AtomicBool::new(false),
            metrics,
        };
        match snapshot::load_json::<HashMap<String, CacheEntry>>(&geocoder.path) {
            Ok(Some(entries)) => {
                for (k, v) in entries {
                    geocoder.l1.insert(k, v);
                }
                info!(
                    path = %geocoder.path.display(),
                    entries = geocoder.l1.len(),
                    "geocoding_cache_loaded",
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %geocoder.path.display(), error = %e, "geocoding_cache_load_failed")
            }
        }
        geocoder
            .metrics
            .geocache_size
            .store(geocoder.l1.len() as u64, Ordering::Relaxed);
        geocoder
    }

    /// Cache-only lookup for the correlator thread. A miss returns
    /// `unknown` immediately and schedules an async resolve; duplicate
    /// requests for the same rounded key coalesce.
    pub fn lookup_or_request(&self, lat: f64, lon: f64) -> GeoCodes {
        let key = round_key(lat, lon);
        if let Some(entry) = self.l1.get(&key) {
            self.metrics.geocode_hits.fetch_add(1, Ordering::Relaxed);
            return GeoCodes {
                country: entry.country.clone(),
                subdivision: entry.subdivision.clone(),
            };
        }
        self.metrics.geocode_misses.fetch_add(1, Ordering::Relaxed);
        if self.inflight.insert(key.clone(), ()).is_none() {
            let job = ResolveJob { key: key.clone(), latitude: lat, longitude: lon };
            if self.resolve_tx.try_send(job).is_err() {
                // Queue full; let a later reading re-request.
                self.inflight.remove(&key);
            }
        }
        GeoCodes::unknown()
    }

    /// Store a resolver answer. Monotonic: a real answer never regresses to
    /// `unknown`, and an existing real answer is never overwritten.
    fn insert_resolved(&self, key: &str, codes: GeoCodes, now: i64) {
        if let Some(existing) = self.l1.get(key) {
            let existing_known = existing.country != UNKNOWN;
            if existing_known || codes.is_unknown() {
                return;
            }
        }
        self.l1.insert(
            key.to_string(),
            CacheEntry {
                country: codes.country,
                subdivision: codes.subdivision,
                resolved_at: now,
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
        self.metrics.geocache_size.store(self.l1.len() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }
        let entries: HashMap<String, CacheEntry> = self
            .l1
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Err(e) = snapshot::write_json_atomic(&self.path, &entries) {
            self.dirty.store(true, Ordering::Relaxed);
            warn!(path = %self.path.display(), error = %e, "geocoding_cache_snapshot_failed");
        }
    }

    pub fn len(&self) -> usize {
        self.l1.len()
    }

    #[cfg(test)]
    pub fn test_insert(&self, lat: f64, lon: f64, codes: GeoCodes, now: i64) {
        self.insert_resolved(&round_key(lat, lon), codes, now);
    }
}

/// Map resolver output (gazetteer place or online names) to codes.
fn codes_from_names(
    country_code: Option<&str>,
    country_name: Option<&str>,
    admin1: Option<&str>,
) -> GeoCodes {
    let country = country_code
        .map(|c| c.to_lowercase())
        .or_else(|| country_name.and_then(iso3166::country_code).map(str::to_string));
    let Some(country) = country else {
        return GeoCodes::unknown();
    };
    let subdivision = admin1
        .and_then(|a| iso3166::subdivision_code(&country, a))
        .map(str::to_string)
        .unwrap_or_else(|| {
            if let Some(a) = admin1 {
                debug!(country = country.as_str(), admin1 = a, "unmapped_admin1");
            }
            UNKNOWN.to_string()
        });
    GeoCodes { country, subdivision }
}

/// Background resolve worker: gazetteer first, online second. Outstanding
/// jobs are abandoned on shutdown; the periodic snapshot keeps resolved
/// entries durable.
pub async fn run_resolver(
    geocoder: Arc<ReverseGeocoder>,
    mut rx: mpsc::Receiver<ResolveJob>,
    gazetteer: Option<Gazetteer>,
    mut online: Option<NominatimClient>,
    shutdown: CancellationToken,
) {
    let mut snapshot_tick = tokio::time::interval(std::time::Duration::from_secs(60));
    snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        let job = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(job) => job,
                None => break,
            },
            _ = snapshot_tick.tick() => {
                geocoder.snapshot_if_dirty();
                continue;
            }
            _ = shutdown.cancelled() => break,
        };

        let now = chrono::Utc::now().timestamp();
        let mut resolved = gazetteer.as_ref().and_then(|g| {
            g.nearest(job.latitude, job.longitude).map(|place| {
                codes_from_names(Some(place.country.as_str()), None, Some(place.admin1.as_str()))
            })
        });

        if resolved.is_none() {
            if let Some(client) = online.as_mut() {
                resolved = client.resolve(job.latitude, job.longitude).await.map(|names| {
                    codes_from_names(
                        names.country_code.as_deref(),
                        names.country_name.as_deref(),
                        names.admin1_name.as_deref(),
                    )
                });
            } else {
                // No resolver left; pin the key to unknown so the cache
                // answers synchronously from now on.
                resolved = Some(GeoCodes::unknown());
            }
        }

        match resolved {
            Some(codes) => {
                if codes.is_unknown() {
                    geocoder.metrics.geocode_failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    geocoder.metrics.geocode_resolved.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    key = job.key.as_str(),
                    country = codes.country.as_str(),
                    subdivision = codes.subdivision.as_str(),
                    "geocode_resolved",
                );
                geocoder.insert_resolved(&job.key, codes, now);
            }
            // Transient online failure: leave the cache alone so a later
            // reading retries.
            None => {
                geocoder.metrics.geocode_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        geocoder.inflight.remove(&job.key);
    }
    geocoder.snapshot_if_dirty();
}
