//! Process-wide topic broker multiplexing deployment, log, health, stats,
//! provisioning and agent-update events into client-facing streams.
//!
//! Publishing never blocks: each subscriber owns a bounded ring buffer and
//! loses its oldest event on overflow. The broker keeps only weak references
//! to subscribers, so a dropped handle is all it takes to unsubscribe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use paasdeploy_common::event::Event;
use tokio::sync::Notify;

/// Events a subscriber may lag behind before its oldest are discarded.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// What a subscription listens to: one topic, a topic prefix (`logs.*`), or
/// everything (`*`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicFilter {
    Exact(String),
    Prefix(String),
    All,
}

impl TopicFilter {
    /// Parse the filter syntax subscribers use: `deploys`, `logs.*`, `*`.
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            TopicFilter::All
        } else if let Some(prefix) = raw.strip_suffix('*') {
            TopicFilter::Prefix(prefix.to_string())
        } else {
            TopicFilter::Exact(raw.to_string())
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Exact(exact) => topic == exact,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicFilter::All => true,
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<SubscriberInner>>>,
}

struct SubscriberInner {
    filter: TopicFilter,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// A live subscription. Dropping (or closing) it releases the broker's hold
/// on the subscriber; the broker prunes the dead weak reference on the next
/// publish.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        let inner = Arc::new(SubscriberInner {
            filter,
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_BUFFER)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        self.subscribers.lock().unwrap().push(Arc::downgrade(&inner));

        Subscription { inner }
    }

    /// Deliver an event to every live subscriber whose filter matches its
    /// topic. Never blocks on a slow consumer; dead subscribers are pruned
    /// in passing.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let mut subscribers = self.subscribers.lock().unwrap();

        subscribers.retain(|weak| {
            let Some(subscriber) = weak.upgrade() else {
                return false;
            };
            if subscriber.closed.load(Ordering::Acquire) {
                return false;
            }

            if subscriber.filter.matches(&topic) {
                let mut queue = subscriber.queue.lock().unwrap();
                if queue.len() >= SUBSCRIBER_BUFFER {
                    queue.pop_front();
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event.clone());
                drop(queue);
                subscriber.notify.notify_one();
            }

            true
        });
    }

    /// Live subscriber count, after pruning. The leak law: this returns to
    /// its previous value once handles are dropped.
    pub fn retained_subscribers(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|weak| weak.upgrade().is_some());
        subscribers.len()
    }
}

impl Subscription {
    /// Next event in FIFO order, or `None` once the subscription is closed
    /// and drained.
    pub async fn next(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            self.inner.notify.notified().await;
        }
    }

    /// Events lost to this subscriber through buffer overflow.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use paasdeploy_common::deployment::{Stage, Status};
    use paasdeploy_common::event::{DeployEvent, Event};
    use paasdeploy_common::log::{Item, Level};
    use uuid::Uuid;

    use super::{EventBus, TopicFilter, SUBSCRIBER_BUFFER};

    fn log_event(deployment_id: Uuid, message: &str) -> Event {
        Event::Log(Item::new(deployment_id, Stage::Build, Level::Info, message))
    }

    fn deploy_event() -> Event {
        Event::Deploy(DeployEvent {
            deployment_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            status: Status::Running,
            stage: None,
            error_kind: None,
            error: None,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let sub = bus.subscribe(TopicFilter::parse(&format!("logs.{id}")));

        for i in 0..10 {
            bus.publish(log_event(id, &format!("line {i}")));
        }

        for i in 0..10 {
            match sub.next().await.unwrap() {
                Event::Log(item) => assert_eq!(item.message, format!("line {i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn filters_route_by_topic() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();

        let deploys = bus.subscribe(TopicFilter::parse("deploys"));
        let logs = bus.subscribe(TopicFilter::parse("logs.*"));
        let all = bus.subscribe(TopicFilter::parse("*"));

        bus.publish(deploy_event());
        bus.publish(log_event(id, "hello"));

        assert!(matches!(deploys.next().await.unwrap(), Event::Deploy(_)));
        assert!(matches!(logs.next().await.unwrap(), Event::Log(_)));
        assert!(matches!(all.next().await.unwrap(), Event::Deploy(_)));
        assert!(matches!(all.next().await.unwrap(), Event::Log(_)));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let sub = bus.subscribe(TopicFilter::All);

        for i in 0..SUBSCRIBER_BUFFER + 5 {
            bus.publish(log_event(id, &format!("line {i}")));
        }

        assert_eq!(sub.dropped(), 5);

        // the first five were discarded, order is otherwise intact
        match sub.next().await.unwrap() {
            Event::Log(item) => assert_eq!(item.message, "line 5"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_subscription_ends_after_drain() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let sub = bus.subscribe(TopicFilter::All);

        bus.publish(log_event(id, "last words"));
        sub.close();

        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_handles_do_not_leak() {
        let bus = EventBus::new();
        let baseline = bus.retained_subscribers();

        for _ in 0..100 {
            let sub = bus.subscribe(TopicFilter::All);
            bus.publish(deploy_event());
            let _ = sub.next().await;
            drop(sub);
        }

        assert_eq!(bus.retained_subscribers(), baseline);
    }

    #[tokio::test]
    async fn publish_does_not_block_on_slow_subscriber() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let _slow = bus.subscribe(TopicFilter::All);

        // far beyond any buffer; publish must return regardless
        for i in 0..10_000 {
            bus.publish(log_event(id, &format!("line {i}")));
        }
    }
}
