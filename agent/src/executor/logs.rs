//! Log routing between the deployment pipeline and its gRPC subscribers.
//!
//! Each stage writes into a bounded queue drained by a forwarder task; the
//! router fans finished entries out to every subscriber of the deployment.
//! A slow or absent consumer never blocks a stage: the queue drops its
//! oldest entry on overflow and records a synthetic marker instead.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use paasdeploy_common::deployment::Stage;
use paasdeploy_common::log::{Item, Level};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Entries buffered per stage before the oldest is discarded.
pub const STAGE_BUFFER: usize = 256;

/// One marker entry is recorded for every this many discarded entries.
pub const DROP_MARKER_EVERY: usize = 32;

/// Extra room a subscriber gets beyond the replayed history.
const SUBSCRIBER_BUFFER: usize = 256;

/// Finished deployment ids remembered so late subscribers get a closed
/// stream instead of an open one that never ends.
const FINISHED_REMEMBERED: usize = 128;

/// Fan-out point for deployment logs, keyed by deployment id.
#[derive(Default)]
pub struct LogRouter {
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    active: HashMap<Uuid, DeploymentLog>,
    finished: VecDeque<Uuid>,
}

#[derive(Default)]
struct DeploymentLog {
    history: Vec<Item>,
    subscribers: Vec<mpsc::Sender<Item>>,
}

impl LogRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the deployment known. Idempotent; `subscribe` also registers,
    /// since the log subscription usually arrives before the deploy call.
    pub fn begin(&self, deployment_id: Uuid) {
        self.state
            .lock()
            .unwrap()
            .active
            .entry(deployment_id)
            .or_default();
    }

    /// Attach a subscriber. Entries already emitted are replayed first so a
    /// subscriber always observes a prefix-preserving view of the stream.
    /// A deployment not begun yet is registered on the spot; one already
    /// finished yields a closed, empty channel.
    pub fn subscribe(&self, deployment_id: Uuid) -> mpsc::Receiver<Item> {
        let mut state = self.state.lock().unwrap();

        if state.finished.contains(&deployment_id) {
            return mpsc::channel(1).1;
        }

        let log = state.active.entry(deployment_id).or_default();
        let (tx, rx) = mpsc::channel(log.history.len() + SUBSCRIBER_BUFFER);
        for item in &log.history {
            // Capacity covers the whole history, so this never fails.
            let _ = tx.try_send(item.clone());
        }
        log.subscribers.push(tx);
        rx
    }

    /// Record one entry and hand it to every live subscriber. Subscribers
    /// that fell behind lose this entry; subscribers that went away are
    /// dropped.
    pub fn publish(&self, item: Item) {
        let mut state = self.state.lock().unwrap();

        if let Some(log) = state.active.get_mut(&item.deployment_id) {
            log.history.push(item.clone());
            log.subscribers
                .retain(|tx| !matches!(tx.try_send(item.clone()), Err(mpsc::error::TrySendError::Closed(_))));
        }
    }

    /// End the stream for a deployment: subscriber channels close once
    /// drained and the history is released.
    pub fn finish(&self, deployment_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(&deployment_id);

        state.finished.push_back(deployment_id);
        if state.finished.len() > FINISHED_REMEMBERED {
            state.finished.pop_front();
        }
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }
}

struct StageQueue {
    items: VecDeque<Item>,
    dropped_total: usize,
    closed: bool,
}

/// Writer handle one pipeline stage logs through.
pub struct StageLog {
    deployment_id: Uuid,
    stage: Stage,
    shared: Arc<StageShared>,
    forwarder: JoinHandle<()>,
}

struct StageShared {
    queue: Mutex<StageQueue>,
    notify: Notify,
}

impl StageLog {
    pub fn new(router: Arc<LogRouter>, deployment_id: Uuid, stage: Stage) -> Self {
        let shared = Arc::new(StageShared {
            queue: Mutex::new(StageQueue {
                items: VecDeque::with_capacity(STAGE_BUFFER),
                dropped_total: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });

        let forwarder = tokio::spawn({
            let shared = shared.clone();
            async move {
                loop {
                    let (batch, closed) = {
                        let mut queue = shared.queue.lock().unwrap();
                        (queue.items.drain(..).collect::<Vec<_>>(), queue.closed)
                    };

                    for item in batch {
                        router.publish(item);
                    }

                    if closed {
                        break;
                    }
                    shared.notify.notified().await;
                }
            }
        });

        Self {
            deployment_id,
            stage,
            shared,
            forwarder,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Level::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Level::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Level::Error, message.into());
    }

    fn push(&self, level: Level, message: String) {
        let item = Item::new(self.deployment_id, self.stage, level, message);

        let mut queue = self.shared.queue.lock().unwrap();
        if queue.closed {
            return;
        }
        enqueue(&mut queue, item, self.deployment_id, self.stage);
        drop(queue);

        self.shared.notify.notify_one();
    }

    /// Close the stage channel and wait for buffered entries to reach the
    /// router, so the next stage's entries sort after this one's.
    pub async fn close(self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.closed = true;
        }
        self.shared.notify.notify_one();
        let _ = self.forwarder.await;
    }
}

fn enqueue(queue: &mut StageQueue, item: Item, deployment_id: Uuid, stage: Stage) {
    if queue.items.len() >= STAGE_BUFFER {
        queue.items.pop_front();
        queue.dropped_total += 1;

        if queue.dropped_total % DROP_MARKER_EVERY == 0 {
            queue.items.pop_front();
            queue
                .items
                .push_back(Item::dropped(deployment_id, stage, DROP_MARKER_EVERY));
        }
    }

    queue.items.push_back(item);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use paasdeploy_common::deployment::Stage;
    use paasdeploy_common::log::{Item, Level, DROPPED_MESSAGE};
    use uuid::Uuid;

    use super::{enqueue, LogRouter, StageLog, StageQueue, DROP_MARKER_EVERY, STAGE_BUFFER};

    fn new_queue() -> Mutex<StageQueue> {
        Mutex::new(StageQueue {
            items: VecDeque::new(),
            dropped_total: 0,
            closed: false,
        })
    }

    #[tokio::test]
    async fn subscriber_sees_entries_in_emission_order() {
        let router = LogRouter::new();
        let id = Uuid::new_v4();
        router.begin(id);

        let mut rx = router.subscribe(id);

        let log = StageLog::new(router.clone(), id, Stage::GitSync);
        for i in 0..10 {
            log.info(format!("line {i}"));
        }
        log.close().await;
        router.finish(id);

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            seen.push(item.message);
        }
        assert_eq!(seen, (0..10).map(|i| format!("line {i}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn late_subscriber_gets_history_replay() {
        let router = LogRouter::new();
        let id = Uuid::new_v4();
        router.begin(id);

        let log = StageLog::new(router.clone(), id, Stage::Build);
        log.info("first");
        log.info("second");
        log.close().await;

        let mut rx = router.subscribe(id);
        router.finish(id);

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert_eq!(rx.recv().await.unwrap().message, "second");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn finished_deployment_yields_closed_stream() {
        let router = LogRouter::new();
        let id = Uuid::new_v4();
        router.begin(id);
        router.finish(id);

        let mut rx = router.subscribe(id);
        assert!(rx.recv().await.is_none());
        assert_eq!(router.retained(), 0);
    }

    #[tokio::test]
    async fn subscribing_before_begin_loses_nothing() {
        let router = LogRouter::new();
        let id = Uuid::new_v4();

        // the control plane's subscription usually lands first
        let mut rx = router.subscribe(id);

        router.begin(id);
        let log = StageLog::new(router.clone(), id, Stage::GitSync);
        log.info("cloning");
        log.close().await;
        router.finish(id);

        assert_eq!(rx.recv().await.unwrap().message, "cloning");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn overflow_drops_oldest_and_records_marker() {
        let queue = new_queue();
        let id = Uuid::new_v4();

        let mut guard = queue.lock().unwrap();
        for i in 0..STAGE_BUFFER + DROP_MARKER_EVERY {
            let item = Item::new(id, Stage::Build, Level::Info, format!("line {i}"));
            enqueue(&mut guard, item, id, Stage::Build);
        }

        assert_eq!(guard.dropped_total, DROP_MARKER_EVERY);
        assert!(guard.items.len() <= STAGE_BUFFER);

        // the oldest lines are gone
        let first = guard.items.front().unwrap();
        assert_ne!(first.message, "line 0");

        // and one marker entry recorded the loss
        let markers = guard
            .items
            .iter()
            .filter(|item| item.message.contains(DROPPED_MESSAGE))
            .count();
        assert_eq!(markers, 1);
    }
}
