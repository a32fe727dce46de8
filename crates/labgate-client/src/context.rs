use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use labgate_core::activity::ActivityFeed;
use labgate_core::counts::AggregateCounts;
use labgate_core::machine::{MachineId, MachinePatch};
use labgate_core::mirror::{MachineMirror, MergeOutcome};
use labgate_core::time::{Revision, RevisionClock};

use crate::access_log::AccessLogView;
use crate::config::SyncConfig;
use crate::counts::{CounterView, CountsMode, CountsReading};
use crate::notify::Notifier;

/// Process-scoped sync state shared by every workflow.
///
/// Uses `Rc<RefCell>` because the engine runs on a single-threaded runtime.
/// Borrows are never held across an `.await`.
///
/// Reads are public. Writes are crate-private so that only the unlock
/// controller, the reconciler and the machine directory change the mirror,
/// and only the unlock controller feeds the activity feed.
pub struct SyncContext {
    mirror: RefCell<MachineMirror>,
    activity: RefCell<ActivityFeed>,
    access_log: RefCell<AccessLogView>,
    counters: RefCell<CounterView>,
    clock: RefCell<RevisionClock>,
    notifier: Rc<dyn Notifier>,
}

impl SyncContext {
    pub fn new(config: &SyncConfig, notifier: Rc<dyn Notifier>) -> Self {
        Self {
            mirror: RefCell::new(MachineMirror::new()),
            activity: RefCell::new(ActivityFeed::with_capacity(config.activity_capacity)),
            access_log: RefCell::new(AccessLogView::new(config.per_page)),
            counters: RefCell::new(CounterView::new(
                config.counts_mode,
                config.snapshot_max_age(),
            )),
            clock: RefCell::new(RevisionClock::with_kind(config.revision_kind)),
            notifier,
        }
    }

    pub fn mirror(&self) -> Ref<'_, MachineMirror> {
        self.mirror.borrow()
    }

    pub fn activity(&self) -> Ref<'_, ActivityFeed> {
        self.activity.borrow()
    }

    pub fn access_log(&self) -> Ref<'_, AccessLogView> {
        self.access_log.borrow()
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn counts_mode(&self) -> CountsMode {
        self.counters.borrow().mode()
    }

    /// Current dashboard counters for the configured mode.
    pub fn counts(&self) -> CountsReading {
        let mirror = self.mirror.borrow();
        self.counters.borrow().read(&mirror)
    }

    /// Highest revision issued or observed so far.
    pub fn last_revision(&self) -> Revision {
        self.clock.borrow().last()
    }

    pub(crate) fn mirror_mut(&self) -> RefMut<'_, MachineMirror> {
        self.mirror.borrow_mut()
    }

    pub(crate) fn activity_mut(&self) -> RefMut<'_, ActivityFeed> {
        self.activity.borrow_mut()
    }

    pub(crate) fn access_log_mut(&self) -> RefMut<'_, AccessLogView> {
        self.access_log.borrow_mut()
    }

    pub(crate) fn store_snapshot(&self, counts: AggregateCounts) {
        self.counters.borrow_mut().store_snapshot(counts);
    }

    /// Revision for a write originating on this client.
    pub(crate) fn next_revision(&self) -> Revision {
        self.clock.borrow_mut().next()
    }

    pub(crate) fn observe(&self, revision: Revision) {
        self.clock.borrow_mut().observe(revision);
    }

    /// Revision-gated merge into the mirror. Stale writes are logged and
    /// reported through the outcome; they are never an error.
    pub(crate) fn merge(
        &self,
        id: MachineId,
        patch: &MachinePatch,
        revision: Revision,
    ) -> MergeOutcome {
        self.observe(revision);
        let outcome = self.mirror.borrow_mut().merge_patch(id, patch, revision);
        if let MergeOutcome::Stale { stored, incoming } = &outcome {
            tracing::debug!(machine = id, %stored, %incoming, "Stale write ignored");
        }
        outcome
    }

    /// Drop all process-scoped state, e.g. on logout. The revision clock is
    /// kept so later writes still order after everything already seen.
    pub fn teardown(&self) {
        self.mirror.borrow_mut().clear();
        self.activity.borrow_mut().clear();
        self.access_log.borrow_mut().clear();
        self.counters.borrow_mut().clear();
        tracing::info!("Sync context torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoticeLog;
    use labgate_core::test_helpers::make_scan;

    fn context() -> SyncContext {
        SyncContext::new(&SyncConfig::default(), Rc::new(NoticeLog::default()))
    }

    #[test]
    fn merge_observes_revision() {
        let ctx = context();
        ctx.merge(1, &MachinePatch::unlocked(), Revision(u64::MAX / 2));
        assert!(ctx.next_revision() > Revision(u64::MAX / 2));
    }

    #[test]
    fn stale_merge_is_reported_not_applied() {
        let ctx = context();
        ctx.merge(1, &MachinePatch::default().with_locked(false), Revision(6));
        let outcome = ctx.merge(1, &MachinePatch::default().with_locked(true), Revision(4));
        assert!(outcome.is_stale());
        assert!(!ctx.mirror().get(1).unwrap().is_locked);
    }

    #[test]
    fn counts_follow_mirror_in_derived_mode() {
        let ctx = context();
        ctx.merge(1, &MachinePatch::default().with_locked(true), Revision(1));
        ctx.merge(2, &MachinePatch::default().with_locked(false), Revision(1));
        let reading = ctx.counts();
        assert_eq!(reading.counts.total, 2);
        assert_eq!(reading.counts.locked, 1);
    }

    #[test]
    fn teardown_clears_state_but_not_clock() {
        let ctx = context();
        ctx.merge(1, &MachinePatch::unlocked(), Revision(5_000));
        ctx.activity_mut().push(make_scan(1, "Ada"));
        let before = ctx.last_revision();

        ctx.teardown();
        assert!(ctx.mirror().is_empty());
        assert!(ctx.activity().is_empty());
        assert!(ctx.access_log().entries().is_empty());
        assert_eq!(ctx.last_revision(), before);
    }

    #[test]
    fn activity_capacity_from_config() {
        let config = SyncConfig {
            activity_capacity: 3,
            ..SyncConfig::default()
        };
        let ctx = SyncContext::new(&config, Rc::new(NoticeLog::default()));
        assert_eq!(ctx.activity().capacity(), 3);
    }
}
