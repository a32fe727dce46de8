use std::rc::Rc;

use tokio::task::JoinHandle;

use crate::access_log::AccessLogPager;
use crate::channel::EventChannel;
use crate::config::{ChannelConfig, SyncConfig};
use crate::context::SyncContext;
use crate::directory::MachineDirectory;
use crate::notify::Notifier;
use crate::reconciler::Reconciler;
use crate::refresh::Refresher;
use crate::transport::HttpClient;
use crate::unlock::UnlockController;

/// Every workflow wired to one shared [`SyncContext`].
pub struct Engine<H> {
    pub ctx: Rc<SyncContext>,
    pub unlock: UnlockController<H>,
    pub directory: MachineDirectory<H>,
    pub access_log: AccessLogPager<H>,
    pub reconciler: Rc<Reconciler>,
    http: Rc<H>,
    config: SyncConfig,
}

impl<H: HttpClient + 'static> Engine<H> {
    pub fn new(http: Rc<H>, config: SyncConfig, notifier: Rc<dyn Notifier>) -> Self {
        let ctx = Rc::new(SyncContext::new(&config, notifier));
        Self {
            unlock: UnlockController::new(Rc::clone(&http), Rc::clone(&ctx)),
            directory: MachineDirectory::new(Rc::clone(&http), Rc::clone(&ctx)),
            access_log: AccessLogPager::new(Rc::clone(&http), Rc::clone(&ctx)),
            reconciler: Rc::new(Reconciler::new(Rc::clone(&ctx))),
            ctx,
            http,
            config,
        }
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    pub fn refresher(&self) -> Refresher<H> {
        Refresher::new(
            Rc::clone(&self.http),
            Rc::clone(&self.ctx),
            self.config.refresh_interval(),
        )
    }

    /// Subscribe to the push channel and run the reconciler as a local task.
    /// A reconnect triggers a bulk refresh. Must be called inside a
    /// `LocalSet`.
    pub fn spawn_reconciler<C: EventChannel>(
        &self,
        channel: &C,
        config: &ChannelConfig,
    ) -> JoinHandle<()> {
        let rx = channel.subscribe(&config.channel, &config.events);
        let reconciler = Rc::clone(&self.reconciler);
        let directory = self.directory.clone();
        tokio::task::spawn_local(async move {
            reconciler
                .run(rx, || {
                    let directory = directory.clone();
                    async move {
                        if let Err(e) = directory.refresh().await {
                            tracing::warn!(error = %e, "Resync after reconnect failed");
                        }
                    }
                })
                .await;
        })
    }

    /// Clear all process-scoped state, e.g. on logout. Reconciler stats
    /// restart so the next session is counted on its own.
    pub fn teardown(&self) {
        tracing::debug!(stats = ?self.reconciler.stats(), "Tearing down session");
        self.reconciler.reset_stats();
        self.unlock.reset();
        self.ctx.teardown();
    }
}
