use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use labgate_core::activity::DEFAULT_ACTIVITY_CAPACITY;
use labgate_core::events::PushEventKind;
use labgate_core::pagination::DEFAULT_PER_PAGE;
use labgate_core::time::RevisionKind;

use crate::counts::CountsMode;

/// Default config file, looked up in the working directory.
pub const CONFIG_FILE: &str = "labgate.toml";

/// Top-level console configuration, loaded from `labgate.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub api: ApiConfig,
    pub channel: ChannelConfig,
    pub sync: SyncConfig,
}

/// REST API access.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            token: None,
            request_timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Push event channel (Reverb / Pusher protocol).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Websocket origin, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    pub app_key: String,
    pub channel: String,
    /// Event names to forward. Names are matched after the class namespace
    /// and leading `.` are stripped.
    pub events: Vec<String>,
    pub reconnect_delay_secs: u64,
    /// Fallback keepalive interval when the server does not announce one.
    pub ping_interval_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "ws://127.0.0.1:8080".to_string(),
            app_key: "labgate".to_string(),
            channel: "computers".to_string(),
            events: PushEventKind::ALL
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            reconnect_delay_secs: 5,
            ping_interval_secs: 30,
        }
    }
}

/// Sync engine tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub activity_capacity: usize,
    pub refresh_interval_secs: u64,
    pub counts_mode: CountsMode,
    /// Snapshot counts older than this are not served.
    pub snapshot_max_age_secs: u64,
    pub per_page: u32,
    /// Whether server revisions are timestamps or sequence numbers. Client
    /// writes are stamped in the same domain.
    pub revision_kind: RevisionKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            activity_capacity: DEFAULT_ACTIVITY_CAPACITY,
            refresh_interval_secs: 30,
            counts_mode: CountsMode::Derived,
            snapshot_max_age_secs: 90,
            per_page: DEFAULT_PER_PAGE,
            revision_kind: RevisionKind::Timestamp,
        }
    }
}

impl SyncConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn snapshot_max_age(&self) -> Duration {
        Duration::from_secs(self.snapshot_max_age_secs)
    }
}

impl ConsoleConfig {
    /// Load `labgate.toml` from the working directory if it exists, then
    /// apply environment overrides.
    pub fn load() -> Self {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<ConsoleConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded configuration");
                    if cfg.api.token.is_some() {
                        tracing::warn!(
                            "api.token is set in the config file, prefer LABGATE_API_TOKEN"
                        );
                    }
                    cfg
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to parse config: {e}, using defaults");
                    ConsoleConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                ConsoleConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `LABGATE_*` overrides. Empty and unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("LABGATE_API_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = var("LABGATE_API_TOKEN") {
            self.api.token = Some(token);
        }
        if let Some(url) = var("LABGATE_CHANNEL_URL") {
            self.channel.url = url;
        }
        if let Some(key) = var("LABGATE_CHANNEL_KEY") {
            self.channel.app_key = key;
        }
        if let Some(val) = var("LABGATE_REFRESH_INTERVAL")
            && let Ok(secs) = val.trim().parse::<u64>()
        {
            self.sync.refresh_interval_secs = secs;
        }
        if let Some(val) = var("LABGATE_REVISION_KIND") {
            match val.trim().to_ascii_lowercase().as_str() {
                "timestamp" => self.sync.revision_kind = RevisionKind::Timestamp,
                "sequence" => self.sync.revision_kind = RevisionKind::Sequence,
                other => tracing::warn!(value = other, "Ignoring unknown LABGATE_REVISION_KIND"),
            }
        }
    }

    /// Problems that make the configuration unusable. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match reqwest::Url::parse(&self.api.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {},
            Ok(url) => problems.push(format!(
                "api.base_url must be http or https, got {}",
                url.scheme()
            )),
            Err(e) => problems.push(format!("api.base_url is not a valid URL: {e}")),
        }
        if self.api.request_timeout_secs == 0 {
            problems.push("api.request_timeout_secs must be > 0".to_string());
        }

        if self.channel.enabled {
            match reqwest::Url::parse(&self.channel.url) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {},
                Ok(url) => problems.push(format!(
                    "channel.url must be ws or wss, got {}",
                    url.scheme()
                )),
                Err(e) => problems.push(format!("channel.url is not a valid URL: {e}")),
            }
            if self.channel.app_key.trim().is_empty() {
                problems.push("channel.app_key must not be empty".to_string());
            }
            if self.channel.channel.trim().is_empty() {
                problems.push("channel.channel must not be empty".to_string());
            }
            if self.channel.reconnect_delay_secs == 0 {
                problems.push("channel.reconnect_delay_secs must be > 0".to_string());
            }
            if self.channel.ping_interval_secs == 0 {
                problems.push("channel.ping_interval_secs must be > 0".to_string());
            }
            for name in &self.channel.events {
                if PushEventKind::from_event_name(name).is_none() {
                    problems.push(format!("channel.events has unknown event `{name}`"));
                }
            }
        }

        if self.sync.activity_capacity == 0 {
            problems.push("sync.activity_capacity must be > 0".to_string());
        }
        if self.sync.refresh_interval_secs == 0 {
            problems.push("sync.refresh_interval_secs must be > 0".to_string());
        }
        if self.sync.per_page == 0 {
            problems.push("sync.per_page must be > 0".to_string());
        }
        if self.sync.counts_mode == CountsMode::Snapshot
            && self.sync.snapshot_max_age_secs < self.sync.refresh_interval_secs
        {
            problems.push(format!(
                "sync.snapshot_max_age_secs ({}) must be >= sync.refresh_interval_secs ({})",
                self.sync.snapshot_max_age_secs, self.sync.refresh_interval_secs
            ));
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let cfg = ConsoleConfig::default();
        assert_eq!(cfg.api.base_url, "http://127.0.0.1:8000/api");
        assert!(cfg.api.token.is_none());
        assert_eq!(cfg.sync.activity_capacity, 50);
        assert_eq!(cfg.sync.per_page, 7);
        assert_eq!(cfg.sync.counts_mode, CountsMode::Derived);
        assert_eq!(cfg.sync.revision_kind, RevisionKind::Timestamp);
        assert_eq!(cfg.channel.events.len(), PushEventKind::ALL.len());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
[api]
base_url = "https://lab.example.edu/api"
request_timeout_secs = 5

[channel]
url = "wss://lab.example.edu:443"
app_key = "zfw9iorec1mrb9z6pzeg"
channel = "lab-machines"
events = ["App\\Events\\ComputerLocked", ".computer.unlocked"]

[sync]
activity_capacity = 20
refresh_interval_secs = 15
counts_mode = "snapshot"
snapshot_max_age_secs = 45
revision_kind = "sequence"
"#;
        let cfg: ConsoleConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.api.base_url, "https://lab.example.edu/api");
        assert_eq!(cfg.api.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.channel.channel, "lab-machines");
        assert_eq!(cfg.channel.events.len(), 2);
        assert_eq!(cfg.sync.counts_mode, CountsMode::Snapshot);
        assert_eq!(cfg.sync.snapshot_max_age(), Duration::from_secs(45));
        assert_eq!(cfg.sync.revision_kind, RevisionKind::Sequence);
        // Unset keys keep defaults
        assert_eq!(cfg.channel.reconnect_delay_secs, 5);
        assert_eq!(cfg.sync.per_page, 7);
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LABGATE_API_URL", "http://10.1.1.1/api"),
            ("LABGATE_API_TOKEN", "tok"),
            ("LABGATE_CHANNEL_URL", ""),
            ("LABGATE_REFRESH_INTERVAL", "60"),
            ("LABGATE_REVISION_KIND", "Sequence"),
        ]
        .into_iter()
        .collect();
        let mut cfg = ConsoleConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.api.base_url, "http://10.1.1.1/api");
        assert_eq!(cfg.api.token.as_deref(), Some("tok"));
        // Empty value ignored
        assert_eq!(cfg.channel.url, "ws://127.0.0.1:8080");
        assert_eq!(cfg.sync.refresh_interval_secs, 60);
        assert_eq!(cfg.sync.revision_kind, RevisionKind::Sequence);
    }

    #[test]
    fn unparsable_refresh_interval_is_ignored() {
        let mut cfg = ConsoleConfig::default();
        cfg.apply_env(|k| (k == "LABGATE_REFRESH_INTERVAL").then(|| "soon".to_string()));
        assert_eq!(cfg.sync.refresh_interval_secs, 30);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut cfg = ConsoleConfig::default();
        cfg.api.base_url = "not a url".to_string();
        cfg.sync.activity_capacity = 0;
        cfg.sync.refresh_interval_secs = 0;
        cfg.channel.events.push("student.created".to_string());
        let problems = cfg.validate();
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("api.base_url")));
        assert!(problems.iter().any(|p| p.contains("student.created")));
    }

    #[test]
    fn snapshot_bound_must_cover_refresh_interval() {
        let mut cfg = ConsoleConfig::default();
        cfg.sync.counts_mode = CountsMode::Snapshot;
        cfg.sync.refresh_interval_secs = 60;
        cfg.sync.snapshot_max_age_secs = 30;
        let problems = cfg.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("snapshot_max_age_secs"));

        // Derived mode does not care
        cfg.sync.counts_mode = CountsMode::Derived;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn disabled_channel_skips_channel_checks() {
        let mut cfg = ConsoleConfig::default();
        cfg.channel.enabled = false;
        cfg.channel.url = "http://wrong-scheme".to_string();
        assert!(cfg.validate().is_empty());
        cfg.channel.enabled = true;
        assert_eq!(cfg.validate().len(), 1);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ConsoleConfig::load_from(Path::new("/nonexistent/labgate.toml"));
        assert_eq!(cfg.sync.per_page, 7);
    }
}
