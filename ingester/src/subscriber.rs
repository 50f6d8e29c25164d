//! Regional MQTT subscriber fleet.
//!
//! One client per enabled region, each feeding raw frames into the shared
//! decode channel. The mesh is lossy by design, so subscriptions are QoS 0
//! with clean sessions and no client-side queues. A dropped connection is
//! rebuilt with jittered exponential backoff; a successful session resets
//! the backoff. Subscribing happens on every CONNACK because clean sessions
//! forget subscriptions across reconnects.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegionConfig;
use crate::decode::RawFrame;
use crate::metrics::Metrics;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Exponential backoff with ±50% jitter: attempt 0 ≈ 1s, capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = exp.min(BACKOFF_CAP.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(capped * jitter)
}

/// Run one region's subscription until shutdown. Publishing into the decode
/// channel blocks when the pipeline backs up, which is deliberate: the
/// broker buffers better than this process does.
pub async fn run_region(
    region: String,
    cfg: RegionConfig,
    raw_tx: mpsc::Sender<RawFrame>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    'reconnect: loop {
        if shutdown.is_cancelled() {
            break;
        }
        let client_id = format!("wesense_{}", region.to_lowercase());
        let mut options = MqttOptions::new(client_id, cfg.broker.clone(), cfg.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        loop {
            let event = tokio::select! {
                event = eventloop.poll() => event,
                _ = shutdown.cancelled() => {
                    let _ = client.disconnect().await;
                    break 'reconnect;
                }
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!(
                        region = region.as_str(),
                        broker = cfg.broker.as_str(),
                        topic = cfg.topic.as_str(),
                        "connected",
                    );
                    attempt = 0;
                    if let Err(e) = client.subscribe(&cfg.topic, QoS::AtMostOnce).await {
                        warn!(region = region.as_str(), error = %e, "subscribe_failed");
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    metrics.region(&region).messages.fetch_add(1, Ordering::Relaxed);
                    let frame = RawFrame {
                        region: region.clone(),
                        topic: publish.topic.clone(),
                        payload: Bytes::from(publish.payload.to_vec()),
                    };
                    if raw_tx.send(frame).await.is_err() {
                        // Decode stage is gone; nothing left to feed.
                        let _ = client.disconnect().await;
                        break 'reconnect;
                    }
                }
                Ok(other) => {
                    debug!(region = region.as_str(), event = ?other, "mqtt_event");
                }
                Err(e) => {
                    metrics.region(&region).reconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(attempt);
                    warn!(
                        region = region.as_str(),
                        error = %e,
                        retry_in_secs = delay.as_secs_f64(),
                        "connection_lost",
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => break 'reconnect,
                    }
                    continue 'reconnect;
                }
            }
        }
    }
    info!(region = region.as_str(), "subscriber_stopped");
}
