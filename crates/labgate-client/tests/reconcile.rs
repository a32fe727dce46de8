mod common;

use std::cell::RefCell;

use serde_json::json;
use tokio::sync::mpsc;

use labgate_client::channel::{ChannelMessage, EventChannel};
use labgate_client::config::{ChannelConfig, SyncConfig};
use labgate_client::reconciler::ReconcileOutcome;
use labgate_core::events::NormalizeError;
use labgate_core::mirror::MergeOutcome;
use labgate_core::test_helpers::{lock_push, machine_json};

use common::scripted_engine;

/// Channel that hands out a receiver the test feeds by hand.
struct ManualChannel {
    rx: RefCell<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    subscribed: RefCell<Vec<(String, Vec<String>)>>,
}

impl ManualChannel {
    fn new() -> (Self, mpsc::UnboundedSender<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            rx: RefCell::new(Some(rx)),
            subscribed: RefCell::new(Vec::new()),
        };
        (channel, tx)
    }
}

impl EventChannel for ManualChannel {
    fn subscribe(
        &self,
        channel: &str,
        events: &[String],
    ) -> mpsc::UnboundedReceiver<ChannelMessage> {
        self.subscribed
            .borrow_mut()
            .push((channel.to_string(), events.to_vec()));
        self.rx.borrow_mut().take().unwrap()
    }
}

fn connected(socket_id: &str) -> ChannelMessage {
    ChannelMessage::Connected {
        socket_id: socket_id.to_string(),
    }
}

fn event(name: &str, payload: serde_json::Value) -> ChannelMessage {
    ChannelMessage::Event {
        name: name.to_string(),
        payload,
    }
}

#[tokio::test]
async fn pushes_are_merged_in_revision_order() {
    let (engine, _, _) = scripted_engine(SyncConfig::default());
    let reconciler = &engine.reconciler;

    assert_eq!(
        reconciler.handle("computer.status", &lock_push(1, true, 10)),
        ReconcileOutcome::Merged(MergeOutcome::Created)
    );
    assert!(matches!(
        reconciler.handle(".ComputerUnlocked", &json!({ "id": 1, "revision": 12 })),
        ReconcileOutcome::Merged(MergeOutcome::Applied { .. })
    ));
    assert!(matches!(
        reconciler.handle("computer.locked", &json!({ "id": 1, "revision": 11 })),
        ReconcileOutcome::Rejected(_)
    ));

    assert!(!engine.ctx.mirror().get(1).unwrap().is_locked);
    let stats = reconciler.stats();
    assert_eq!((stats.created, stats.applied, stats.stale), (1, 1, 1));
}

#[tokio::test]
async fn malformed_and_unknown_events_are_counted() {
    let (engine, _, _) = scripted_engine(SyncConfig::default());
    let reconciler = &engine.reconciler;

    assert_eq!(
        reconciler.handle("computer.status", &json!({ "id": 1 })),
        ReconcileOutcome::Malformed(NormalizeError::MissingRevision { machine: 1 })
    );
    assert_eq!(
        reconciler.handle("lab.renamed", &json!({ "id": 1, "revision": 1 })),
        ReconcileOutcome::Ignored
    );

    let stats = reconciler.stats();
    assert_eq!((stats.malformed, stats.ignored), (1, 1));
    assert!(engine.ctx.mirror().is_empty());
}

#[tokio::test]
async fn reconnect_triggers_bulk_refresh() {
    let (engine, http, _) = scripted_engine(SyncConfig::default());
    http.ok(
        "GET /computers",
        json!({ "computers": [machine_json(1, true), machine_json(2, false)] }),
    );
    let (channel, tx) = ManualChannel::new();
    let config = ChannelConfig::default();

    tx.send(connected("1.1")).unwrap();
    tx.send(event("computer.unlocked", json!({ "id": 7, "revision": 3 })))
        .unwrap();
    tx.send(ChannelMessage::Disconnected {
        reason: "closed by server".to_string(),
    })
    .unwrap();
    tx.send(connected("1.2")).unwrap();
    drop(tx);

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async { engine.spawn_reconciler(&channel, &config).await })
        .await
        .unwrap();

    assert_eq!(
        channel.subscribed.borrow()[0],
        (config.channel.clone(), config.events.clone())
    );
    // Only the second Connected resyncs
    assert_eq!(http.count("GET /computers"), 1);
    assert_eq!(engine.reconciler.stats().reconnects, 1);
    // The refresh replaced the mirror, dropping machine 7
    let mirror = engine.ctx.mirror();
    assert_eq!(mirror.len(), 2);
    assert!(mirror.get(1).unwrap().is_locked);
}

#[tokio::test]
async fn failed_resync_keeps_reconciler_running() {
    let (engine, http, _) = scripted_engine(SyncConfig::default());
    http.status("GET /computers", 500, None);
    let (channel, tx) = ManualChannel::new();

    tx.send(connected("a")).unwrap();
    tx.send(connected("b")).unwrap();
    tx.send(event("computer.offline", json!({ "id": 3, "revision": 9 })))
        .unwrap();
    drop(tx);

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            engine
                .spawn_reconciler(&channel, &ChannelConfig::default())
                .await
        })
        .await
        .unwrap();

    assert!(!engine.ctx.mirror().get(3).unwrap().is_online);
}
