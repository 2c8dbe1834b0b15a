use std::path::PathBuf;
use std::time::Duration;

use matchfeed_transport::{PushConfig, PushTransport, SnapshotClientConfig};
use tracing::warn;

pub const DEFAULT_REFRESH_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub api_base: String,
    pub push_url: String,
    pub push_transport: PushTransport,
    pub push_event: String,
    /// `None` leaves snapshot requests unbounded.
    pub http_timeout_secs: Option<u64>,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080/api".to_string(),
            push_url: "http://localhost:8080/push".to_string(),
            push_transport: PushTransport::Polling,
            push_event: matchfeed_transport::push::DEFAULT_EVENT_NAME.to_string(),
            http_timeout_secs: None,
            user_agent: "matchfeed/0.1".to_string(),
            scheduler_enabled: false,
            refresh_cron: DEFAULT_REFRESH_CRON.to_string(),
            web_port: 3000,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or unparsable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let push_transport = match lookup("MATCHFEED_PUSH_TRANSPORT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "unknown MATCHFEED_PUSH_TRANSPORT; using polling");
                PushTransport::Polling
            }),
            None => defaults.push_transport,
        };
        Self {
            api_base: lookup("MATCHFEED_API_BASE").unwrap_or(defaults.api_base),
            push_url: lookup("MATCHFEED_PUSH_URL").unwrap_or(defaults.push_url),
            push_transport,
            push_event: lookup("MATCHFEED_PUSH_EVENT").unwrap_or(defaults.push_event),
            http_timeout_secs: lookup("MATCHFEED_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|secs| *secs > 0),
            user_agent: lookup("MATCHFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: lookup("MATCHFEED_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            refresh_cron: lookup("MATCHFEED_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            web_port: lookup("MATCHFEED_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.web_port),
            workspace_root: lookup("MATCHFEED_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn snapshot_client_config(&self) -> SnapshotClientConfig {
        SnapshotClientConfig {
            base_url: self.api_base.clone(),
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
            ..SnapshotClientConfig::default()
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            url: self.push_url.clone(),
            transport: self.push_transport,
            event_name: self.push_event.clone(),
            user_agent: Some(self.user_agent.clone()),
            ..PushConfig::default()
        }
    }
}
