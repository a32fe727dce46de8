use std::rc::Rc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::context::SyncContext;
use crate::counts::{CountsMode, fetch_snapshot};
use crate::directory::MachineDirectory;
use crate::error::SyncError;
use crate::transport::HttpClient;

/// What one refresh tick accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub machines: Option<usize>,
    pub snapshot: bool,
}

/// Periodic bulk refresh of the mirror, plus the counter snapshot when the
/// counters run in snapshot mode.
pub struct Refresher<H> {
    http: Rc<H>,
    ctx: Rc<SyncContext>,
    directory: MachineDirectory<H>,
    interval: Duration,
}

impl<H: HttpClient> Refresher<H> {
    pub fn new(http: Rc<H>, ctx: Rc<SyncContext>, interval: Duration) -> Self {
        let directory = MachineDirectory::new(Rc::clone(&http), Rc::clone(&ctx));
        Self {
            http,
            ctx,
            directory,
            interval,
        }
    }

    /// One refresh pass. Each part is attempted even if another fails; the
    /// first error is returned after both have run.
    pub async fn tick(&self) -> Result<TickReport, SyncError> {
        let mut report = TickReport::default();
        let mut first_error = None;

        match self.directory.refresh().await {
            Ok(count) => report.machines = Some(count),
            Err(e) => first_error = Some(e),
        }
        if self.ctx.counts_mode() == CountsMode::Snapshot {
            match fetch_snapshot(self.http.as_ref(), &self.ctx).await {
                Ok(_) => report.snapshot = true,
                Err(e) => {
                    first_error.get_or_insert(e);
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Tick forever. The first tick runs immediately; failures are logged
    /// and the loop carries on.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick().await {
                Ok(report) => {
                    tracing::debug!(machines = ?report.machines, snapshot = report.snapshot, "Refresh tick")
                },
                Err(e) => tracing::warn!(error = %e, "Refresh tick failed"),
            }
        }
    }
}
