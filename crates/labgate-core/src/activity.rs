use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default number of scan events kept in the recent-activity feed.
pub const DEFAULT_ACTIVITY_CAPACITY: usize = 50;

/// Name shown when an unlock outcome carries no person.
pub const UNKNOWN_PERSON: &str = "Unknown";

/// Identifier of a scan event.
///
/// `Server` ids come from the access log and deduplicate reliably. `Local`
/// ids are minted on the client when the server omits a log id; they are
/// unique within one outcome but cannot catch the same outcome reported
/// twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanId {
    Server(u64),
    Local { observed_at: u64, seq: u32 },
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local { observed_at, seq } => write!(f, "local-{observed_at}-{seq}"),
        }
    }
}

/// One badge-triggered unlock of one machine, as shown in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub id: ScanId,
    pub name: String,
    pub machine_label: String,
    pub ip_address: String,
    /// Client clock, milliseconds since the Unix epoch.
    pub observed_at: u64,
}

impl ScanEvent {
    pub fn new(
        id: ScanId,
        name: Option<&str>,
        machine_label: impl Into<String>,
        ip_address: impl Into<String>,
        observed_at: u64,
    ) -> Self {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_PERSON);
        Self {
            id,
            name: name.to_string(),
            machine_label: machine_label.into(),
            ip_address: ip_address.into(),
            observed_at,
        }
    }
}

/// Result of pushing into the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    Inserted { evicted: Option<ScanEvent> },
    Duplicate,
}

/// Bounded, deduplicated, newest-first log of scan events.
#[derive(Debug)]
pub struct ActivityFeed {
    entries: VecDeque<ScanEvent>,
    capacity: usize,
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ACTIVITY_CAPACITY)
    }

    /// A feed holding at most `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front. An event whose id is already present is
    /// rejected and the feed is left untouched.
    pub fn push(&mut self, event: ScanEvent) -> PushResult {
        if self.contains(&event.id) {
            return PushResult::Duplicate;
        }
        self.entries.push_front(event);
        let evicted = if self.entries.len() > self.capacity {
            self.entries.pop_back()
        } else {
            None
        };
        PushResult::Inserted { evicted }
    }

    pub fn contains(&self, id: &ScanId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &ScanEvent> {
        self.entries.iter()
    }

    /// The most recent `count` events, newest first.
    pub fn recent(&self, count: usize) -> Vec<&ScanEvent> {
        self.entries.iter().take(count).collect()
    }

    pub fn latest(&self) -> Option<&ScanEvent> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
