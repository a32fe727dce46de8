use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

use serde_json::Value;
use tokio::sync::mpsc;

use labgate_core::events::{NormalizeError, PushEventKind, normalize};
use labgate_core::mirror::MergeOutcome;

use crate::channel::ChannelMessage;
use crate::context::SyncContext;
use crate::error::SyncError;

/// Running totals of what the reconciler did with incoming pushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub created: u64,
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
    /// Events with a name the reconciler does not handle.
    pub ignored: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Merged into the mirror (`Created` or `Applied`).
    Merged(MergeOutcome),
    /// Older than the stored state; nothing changed.
    Rejected(SyncError),
    Malformed(NormalizeError),
    Ignored,
}

/// Merges push events into the mirror.
pub struct Reconciler {
    ctx: Rc<SyncContext>,
    stats: Cell<ReconcilerStats>,
}

impl Reconciler {
    pub fn new(ctx: Rc<SyncContext>) -> Self {
        Self {
            ctx,
            stats: Cell::new(ReconcilerStats::default()),
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.get()
    }

    /// Start counting from zero, e.g. for a new session.
    pub fn reset_stats(&self) {
        self.stats.set(ReconcilerStats::default());
    }

    fn bump(&self, f: impl FnOnce(&mut ReconcilerStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Normalize and merge one push event.
    pub fn handle(&self, event_name: &str, payload: &Value) -> ReconcileOutcome {
        let Some(kind) = PushEventKind::from_event_name(event_name) else {
            tracing::debug!(event = event_name, "Ignoring unhandled push event");
            self.bump(|s| s.ignored += 1);
            return ReconcileOutcome::Ignored;
        };

        let update = match normalize(kind, payload) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(event = %kind, error = %e, "Malformed push payload");
                self.bump(|s| s.malformed += 1);
                return ReconcileOutcome::Malformed(e);
            },
        };

        let outcome = self.ctx.merge(update.id, &update.patch, update.revision);
        match outcome {
            MergeOutcome::Stale { stored, incoming } => {
                self.bump(|s| s.stale += 1);
                ReconcileOutcome::Rejected(SyncError::StaleWriteRejected {
                    machine: update.id,
                    stored,
                    incoming,
                })
            },
            MergeOutcome::Created => {
                tracing::debug!(machine = update.id, revision = %update.revision, "Push created machine");
                self.bump(|s| s.created += 1);
                ReconcileOutcome::Merged(outcome)
            },
            MergeOutcome::Applied { .. } => {
                tracing::trace!(machine = update.id, revision = %update.revision, "Push applied");
                self.bump(|s| s.applied += 1);
                ReconcileOutcome::Merged(outcome)
            },
        }
    }

    /// Consume channel messages until the channel closes. `on_reconnect` runs
    /// after every `Connected` but the first, to resync what was missed.
    pub async fn run<F, Fut>(
        &self,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
        mut on_reconnect: F,
    ) where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut connected_once = false;
        while let Some(msg) = rx.recv().await {
            match msg {
                ChannelMessage::Event { name, payload } => {
                    self.handle(&name, &payload);
                },
                ChannelMessage::Connected { socket_id } => {
                    if connected_once {
                        tracing::info!(%socket_id, "Event channel reconnected, resyncing");
                        self.bump(|s| s.reconnects += 1);
                        on_reconnect().await;
                    }
                    connected_once = true;
                },
                ChannelMessage::Disconnected { reason } => {
                    tracing::warn!(%reason, "Event channel disconnected");
                },
            }
        }
        tracing::info!(stats = ?self.stats(), "Event channel closed, reconciler stopping");
    }
}
