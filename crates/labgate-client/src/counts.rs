use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use labgate_core::counts::{AggregateCounts, StatusDistribution};
use labgate_core::mirror::MachineMirror;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::transport::HttpClient;

const STATUS_DISTRIBUTION: &str = "/computer/status-distribution";

/// Where dashboard counters come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountsMode {
    /// Computed from the mirror on every read.
    #[default]
    Derived,
    /// Server snapshot, served while younger than the configured bound.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountsSource {
    Derived,
    Snapshot {
        age: Duration,
    },
    /// Snapshot mode, but the snapshot was missing or too old.
    Fallback {
        snapshot_age: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountsReading {
    pub counts: AggregateCounts,
    pub source: CountsSource,
}

/// Counter state for the dashboard.
#[derive(Debug)]
pub struct CounterView {
    mode: CountsMode,
    max_age: Duration,
    snapshot: Option<(AggregateCounts, Instant)>,
}

impl CounterView {
    pub fn new(mode: CountsMode, max_age: Duration) -> Self {
        Self {
            mode,
            max_age,
            snapshot: None,
        }
    }

    pub fn mode(&self) -> CountsMode {
        self.mode
    }

    pub fn store_snapshot(&mut self, counts: AggregateCounts) {
        self.store_snapshot_at(counts, Instant::now());
    }

    pub fn store_snapshot_at(&mut self, counts: AggregateCounts, taken_at: Instant) {
        self.snapshot = Some((counts, taken_at));
    }

    pub fn read(&self, mirror: &MachineMirror) -> CountsReading {
        self.read_at(mirror, Instant::now())
    }

    pub fn read_at(&self, mirror: &MachineMirror, now: Instant) -> CountsReading {
        let derived = || AggregateCounts::derive(mirror.iter());
        match self.mode {
            CountsMode::Derived => CountsReading {
                counts: derived(),
                source: CountsSource::Derived,
            },
            CountsMode::Snapshot => {
                let age = self
                    .snapshot
                    .map(|(_, taken)| now.saturating_duration_since(taken));
                match (self.snapshot, age) {
                    (Some((counts, _)), Some(age)) if age <= self.max_age => CountsReading {
                        counts,
                        source: CountsSource::Snapshot { age },
                    },
                    _ => {
                        tracing::debug!(
                            snapshot_age_ms = age.map(|a| u64::try_from(a.as_millis()).unwrap_or(u64::MAX)),
                            "Snapshot counts unavailable or stale, deriving from mirror"
                        );
                        CountsReading {
                            counts: derived(),
                            source: CountsSource::Fallback { snapshot_age: age },
                        }
                    },
                }
            },
        }
    }

    pub fn clear(&mut self) {
        self.snapshot = None;
    }
}

/// Fetch the server's status distribution and store it as the current
/// snapshot.
pub async fn fetch_snapshot<H: HttpClient>(
    http: &H,
    ctx: &SyncContext,
) -> Result<AggregateCounts, SyncError> {
    let body = http.get(STATUS_DISTRIBUTION, &[]).await?;
    let distribution: StatusDistribution =
        serde_json::from_value(body).map_err(|e| SyncError::Decode(e.to_string()))?;
    let counts = AggregateCounts::from(distribution);
    ctx.store_snapshot(counts);
    Ok(counts)
}
