//! Persistent push channel.
//!
//! One [`PushListener`] holds the upstream connection and republishes every
//! match update it receives onto a [`PushHub`]. Each subscription takes its
//! own broadcast receiver from the hub; dropping the receiver unsubscribes.
//!
//! Polling is the default transport. Either transport reconnects on its
//! own with capped exponential backoff.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{build_http_client, BackoffPolicy, TransportError};

pub const DEFAULT_EVENT_NAME: &str = "match_update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushTransport {
    #[default]
    Polling,
    WebSocket,
}

impl FromStr for PushTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "poll" | "long-poll" => Ok(PushTransport::Polling),
            "websocket" | "ws" => Ok(PushTransport::WebSocket),
            other => Err(format!("unknown push transport {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub url: String,
    pub transport: PushTransport,
    pub event_name: String,
    pub reconnect: BackoffPolicy,
    /// Pause between polls that delivered nothing.
    pub idle_poll_delay: Duration,
    pub user_agent: Option<String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/push".to_string(),
            transport: PushTransport::Polling,
            event_name: DEFAULT_EVENT_NAME.to_string(),
            reconnect: BackoffPolicy {
                max_retries: usize::MAX,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
            },
            idle_poll_delay: Duration::from_secs(1),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
struct HubInner {
    updates: broadcast::Sender<JsonValue>,
    shutdown: watch::Sender<bool>,
}

/// Fan-out point for push updates.
#[derive(Debug, Clone)]
pub struct PushHub {
    inner: Arc<HubInner>,
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner { updates, shutdown }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JsonValue> {
        self.inner.updates.subscribe()
    }

    /// Publish one raw record; returns how many subscribers received it.
    pub fn publish(&self, record: JsonValue) -> usize {
        self.inner.updates.send(record).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.updates.receiver_count()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Extract the match records carried by one raw push payload.
///
/// Accepted frames: `{"event"|"type": name, "data"|"payload": record}`,
/// `[name, record]` (optionally behind a numeric packet code), a bare
/// record object, or an array of any of these. Several packets may be
/// joined by the `0x1e` record separator. Envelopes for other event names
/// are skipped.
pub fn parse_push_frames(text: &str, event_name: &str) -> Vec<JsonValue> {
    text.split('\u{1e}')
        .flat_map(|packet| parse_packet(packet, event_name))
        .collect()
}

fn parse_packet(packet: &str, event_name: &str) -> Vec<JsonValue> {
    let trimmed = packet.trim();
    let body = trimmed.trim_start_matches(|c: char| c.is_ascii_digit());
    if body.is_empty() || !(body.starts_with('[') || body.starts_with('{')) {
        return Vec::new();
    }
    match serde_json::from_str::<JsonValue>(body) {
        Ok(value) => records_from_value(value, event_name),
        Err(err) => {
            debug!(error = %err, "ignoring undecodable push packet");
            Vec::new()
        }
    }
}

fn records_from_value(value: JsonValue, event_name: &str) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => {
            if let Some(JsonValue::String(name)) = items.first() {
                if name != event_name {
                    return Vec::new();
                }
                return items
                    .into_iter()
                    .skip(1)
                    .filter(JsonValue::is_object)
                    .take(1)
                    .collect();
            }
            items
                .into_iter()
                .flat_map(|item| records_from_value(item, event_name))
                .collect()
        }
        JsonValue::Object(mut obj) => {
            let payload_key = ["data", "payload"].into_iter().find(|k| obj.contains_key(*k));
            let name = ["event", "type"]
                .into_iter()
                .find_map(|k| obj.get(k).and_then(JsonValue::as_str).map(ToString::to_string));
            match (name, payload_key) {
                (Some(name), Some(key)) => {
                    if name != event_name {
                        return Vec::new();
                    }
                    match obj.remove(key) {
                        Some(record @ JsonValue::Object(_)) => vec![record],
                        _ => Vec::new(),
                    }
                }
                _ => vec![JsonValue::Object(obj)],
            }
        }
        _ => Vec::new(),
    }
}

pub struct PushListener {
    config: PushConfig,
    http: reqwest::Client,
}

impl PushListener {
    pub fn new(config: PushConfig) -> anyhow::Result<Self> {
        Url::parse(&config.url)
            .map_err(|e| anyhow::anyhow!("invalid push url {}: {e}", config.url))?;
        let http = build_http_client(None, config.user_agent.as_deref())?;
        Ok(Self { config, http })
    }

    /// Run the connection loop in the background until `hub.shutdown()`.
    pub fn spawn(self, hub: PushHub) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(hub).await })
    }

    async fn run(self, hub: PushHub) {
        info!(url = %self.config.url, transport = ?self.config.transport, "push listener starting");
        let mut failures = 0usize;
        while !hub.is_shutdown() {
            let outcome = tokio::select! {
                _ = hub.wait_for_shutdown() => break,
                outcome = self.session(&hub) => outcome,
            };

            let pause = match outcome {
                Ok(delivered) => {
                    failures = 0;
                    match self.config.transport {
                        PushTransport::Polling if delivered > 0 => None,
                        PushTransport::Polling => Some(self.config.idle_poll_delay),
                        PushTransport::WebSocket => {
                            info!("push websocket closed; reconnecting");
                            Some(self.config.reconnect.delay_for_attempt(0))
                        }
                    }
                }
                Err(err) => {
                    let delay = self.config.reconnect.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "push channel failed; reconnecting"
                    );
                    Some(delay)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = hub.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!("push listener stopped");
    }

    async fn session(&self, hub: &PushHub) -> Result<usize, TransportError> {
        match self.config.transport {
            PushTransport::Polling => self.poll_once(hub).await,
            PushTransport::WebSocket => self.websocket_session(hub).await,
        }
    }

    async fn poll_once(&self, hub: &PushHub) -> Result<usize, TransportError> {
        let resp = self.http.get(&self.config.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let text = resp.text().await?;
        Ok(self.deliver(hub, &text))
    }

    async fn websocket_session(&self, hub: &PushHub) -> Result<usize, TransportError> {
        let (mut stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        info!(url = %self.config.url, "push websocket connected");

        let mut delivered = 0usize;
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => delivered += self.deliver(hub, &text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => return Err(TransportError::Channel(err.to_string())),
            }
        }
        Ok(delivered)
    }

    fn deliver(&self, hub: &PushHub, text: &str) -> usize {
        let records = parse_push_frames(text, &self.config.event_name);
        let count = records.len();
        for record in records {
            hub.publish(record);
        }
        count
    }
}
