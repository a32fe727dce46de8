use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, or 0 if the system clock is before it.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Ordering marker attached to every state write.
///
/// Server timestamps are carried as milliseconds since the Unix epoch;
/// explicit sequence numbers are carried as-is. Comparison is plain integer
/// ordering, so one deployment must stick to one of the two.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);
    /// Largest revision accepted from the wire. Anything above is treated as
    /// garbage rather than allowed to pin the clock at the top of the range.
    pub const MAX: Revision = Revision(i64::MAX as u64);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What the server's revisions count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionKind {
    /// Milliseconds since the Unix epoch (`updated_at`, `last_seen_at`).
    #[default]
    Timestamp,
    /// Explicit per-deployment sequence numbers.
    Sequence,
}

/// Issues revisions for writes that originate on the client (unlock
/// outcomes, bulk refreshes without a server timestamp).
///
/// Never hands out a value below anything it has already issued or
/// observed, and stays in the server's domain: wall-clock milliseconds for
/// [`RevisionKind::Timestamp`], one past the highest known value for
/// [`RevisionKind::Sequence`].
#[derive(Debug, Default)]
pub struct RevisionClock {
    kind: RevisionKind,
    last: u64,
}

impl RevisionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(kind: RevisionKind) -> Self {
        Self { kind, last: 0 }
    }

    pub fn kind(&self) -> RevisionKind {
        self.kind
    }

    /// Next client revision.
    pub fn next(&mut self) -> Revision {
        match self.kind {
            RevisionKind::Timestamp => self.next_at(now_millis()),
            RevisionKind::Sequence => {
                self.last = self.last.saturating_add(1);
                Revision(self.last)
            },
        }
    }

    /// Next revision given an explicit wall-clock reading in milliseconds.
    pub fn next_at(&mut self, now_ms: u64) -> Revision {
        self.last = now_ms.max(self.last.saturating_add(1));
        Revision(self.last)
    }

    /// Record a revision seen from another source.
    pub fn observe(&mut self, revision: Revision) {
        self.last = self.last.max(revision.0);
    }

    /// Highest revision issued or observed so far.
    pub fn last(&self) -> Revision {
        Revision(self.last)
    }
}
