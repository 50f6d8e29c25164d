//! Online reverse-geocoding fallback.
//!
//! Used only when the gazetteer misses. One request per second globally,
//! with the politeness User-Agent the service requires. Persistent failures
//! put the client in a cooldown window instead of hammering a dead
//! endpoint; individual failures are dropped (the record already went out
//! as `unknown`).

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const FAILURE_COOLDOWN_THRESHOLD: u32 = 5;
const FAILURE_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    country: Option<String>,
    country_code: Option<String>,
    state: Option<String>,
}

/// Free-text place naming as returned by the resolver; code mapping happens
/// in the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedNames {
    pub country_name: Option<String>,
    pub country_code: Option<String>,
    pub admin1_name: Option<String>,
}

pub struct NominatimClient {
    client: reqwest::Client,
    url: String,
    user_agent: String,
    last_request_at: Option<Instant>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl NominatimClient {
    pub fn new(url: String, user_agent: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            user_agent,
            last_request_at: None,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }

    /// Resolve coordinates to place names. `None` means the lookup failed or
    /// the client is cooling down; the caller leaves the cache untouched so
    /// a later reading can retry.
    pub async fn resolve(&mut self, lat: f64, lon: f64) -> Option<ResolvedNames> {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return None;
            }
            self.cooldown_until = None;
            self.consecutive_failures = 0;
        }

        if let Some(last) = self.last_request_at {
            let since = last.elapsed();
            if since < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - since).await;
            }
        }
        self.last_request_at = Some(Instant::now());

        let result = self
            .client
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("accept-language", "en".to_string()),
            ])
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                self.note_failure(&format!("http {}", r.status()));
                return None;
            }
            Err(e) => {
                self.note_failure(&e.to_string());
                return None;
            }
        };
        match response.json::<NominatimResponse>().await {
            Ok(body) => {
                self.consecutive_failures = 0;
                debug!(lat, lon, "nominatim_resolved");
                Some(ResolvedNames {
                    country_name: body.address.country,
                    country_code: body.address.country_code.map(|c| c.to_lowercase()),
                    admin1_name: body.address.state,
                })
            }
            Err(e) => {
                self.note_failure(&e.to_string());
                None
            }
        }
    }

    fn note_failure(&mut self, reason: &str) {
        self.consecutive_failures += 1;
        warn!(
            failures = self.consecutive_failures,
            reason, "nominatim_request_failed",
        );
        if self.consecutive_failures >= FAILURE_COOLDOWN_THRESHOLD {
            self.cooldown_until = Some(Instant::now() + FAILURE_COOLDOWN);
            warn!(
                cooldown_secs = FAILURE_COOLDOWN.as_secs(),
                "nominatim_cooling_down",
            );
        }
    }
}
