//! Event hub - fan-out of live events to connected observers.
//!
//! Observers attach to one topic (an application or operation id, or the
//! global scope). Each subscriber owns a bounded mailbox; the hub only keeps
//! the sending halves. Delivery never holds the registry lock: the subscriber
//! set is copied under a read lock and every send is bounded by a timeout.
//! A subscriber that misses the timeout, or whose mailbox is gone, is evicted
//! and its closure signal fired.

use futures_util::future::join_all;
use nodedash_common::config::HubConfig;
use nodedash_common::{HubEvent, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A serialized event, shared between all mailboxes it is delivered to
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: &'static str,
    pub data: Arc<str>,
}

impl Frame {
    pub fn from_event(event: &HubEvent) -> Self {
        Self {
            kind: event.kind(),
            data: Arc::from(event.to_json()),
        }
    }

    pub fn heartbeat() -> Self {
        Self::from_event(&HubEvent::Heartbeat)
    }
}

/// Result of one bounded delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    TimedOut,
    Closed,
}

/// Registration half of a subscriber. Cheap to clone; holds no receivers.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    mailbox: mpsc::Sender<Frame>,
    closer: mpsc::Sender<()>,
}

/// Receiving half, owned by the connection that created the subscriber
#[derive(Debug)]
pub struct Mailbox {
    id: SubscriberId,
    frames: mpsc::Receiver<Frame>,
    closed: mpsc::Receiver<()>,
}

impl Subscriber {
    pub fn new(capacity: usize) -> (Subscriber, Mailbox) {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (mailbox, frames) = mpsc::channel(capacity.max(1));
        let (closer, closed) = mpsc::channel(1);
        (
            Subscriber {
                id,
                mailbox,
                closer,
            },
            Mailbox { id, frames, closed },
        )
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Send one frame, waiting at most `timeout` for mailbox space.
    pub async fn deliver(&self, frame: Frame, timeout: Duration) -> Delivery {
        match tokio::time::timeout(timeout, self.mailbox.send(frame)).await {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(_)) => Delivery::Closed,
            Err(_) => Delivery::TimedOut,
        }
    }

    /// Non-blocking send; returns false when the frame was dropped
    pub fn offer(&self, frame: Frame) -> bool {
        self.mailbox.try_send(frame).is_ok()
    }

    /// Best-effort; dropped if the signal is already pending or the
    /// connection is gone
    pub fn signal_close(&self) {
        let _ = self.closer.try_send(());
    }
}

impl Mailbox {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next frame, or None once the closure signal fires or the hub side is
    /// gone. The closure signal wins when both are ready.
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            _ = self.closed.recv() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Frame already queued, without waiting
    pub fn try_next(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Whether the hub has signalled closure
    pub fn is_closed(&mut self) -> bool {
        !matches!(
            self.closed.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        )
    }
}

type Registry = HashMap<Topic, HashMap<SubscriberId, Subscriber>>;

pub struct EventHub {
    topics: RwLock<Registry>,
    publish_timeout: Duration,
    global_timeout: Duration,
}

impl EventHub {
    pub fn new(publish_timeout: Duration, global_timeout: Duration) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            publish_timeout,
            global_timeout,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.publish_timeout(), config.global_timeout())
    }

    pub async fn register(&self, topic: Topic, subscriber: Subscriber) {
        debug!("Subscriber {} registered on {}", subscriber.id, topic);
        let mut topics = self.topics.write().await;
        topics
            .entry(topic)
            .or_default()
            .insert(subscriber.id, subscriber);
    }

    /// Returns whether the subscriber was still registered
    pub async fn unregister(&self, topic: &Topic, id: SubscriberId) -> bool {
        let mut topics = self.topics.write().await;
        remove_from(&mut topics, topic, id).is_some()
    }

    /// Deliver to every subscriber of `topic`; returns the delivered count.
    pub async fn publish(&self, topic: &Topic, event: &HubEvent) -> usize {
        let targets = self.snapshot(Some(topic)).await;
        if targets.is_empty() {
            return 0;
        }
        self.fan_out(targets, Frame::from_event(event), self.publish_timeout)
            .await
    }

    /// Deliver to the subscribers of every topic, global scope included.
    pub async fn publish_global(&self, event: &HubEvent) -> usize {
        let targets = self.snapshot(None).await;
        if targets.is_empty() {
            return 0;
        }
        self.fan_out(targets, Frame::from_event(event), self.global_timeout)
            .await
    }

    /// Never waits and never evicts.
    pub async fn heartbeat(&self, topic: &Topic) {
        let frame = Frame::heartbeat();
        for (_, subscriber) in self.snapshot(Some(topic)).await {
            subscriber.offer(frame.clone());
        }
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.topics.read().await.keys().cloned().collect()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.topics.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_registered(&self, topic: &Topic, id: SubscriberId) -> bool {
        self.topics
            .read()
            .await
            .get(topic)
            .is_some_and(|subs| subs.contains_key(&id))
    }

    async fn snapshot(&self, topic: Option<&Topic>) -> Vec<(Topic, Subscriber)> {
        let topics = self.topics.read().await;
        match topic {
            Some(topic) => topics
                .get(topic)
                .map(|subs| {
                    subs.values()
                        .map(|s| (topic.clone(), s.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            None => topics
                .iter()
                .flat_map(|(topic, subs)| subs.values().map(move |s| (topic.clone(), s.clone())))
                .collect(),
        }
    }

    async fn fan_out(
        &self,
        targets: Vec<(Topic, Subscriber)>,
        frame: Frame,
        timeout: Duration,
    ) -> usize {
        let attempts = targets.iter().map(|(_, subscriber)| {
            let frame = frame.clone();
            async move { subscriber.deliver(frame, timeout).await }
        });
        let outcomes = join_all(attempts).await;

        let mut delivered = 0;
        for ((topic, subscriber), outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Delivery::Delivered => delivered += 1,
                Delivery::TimedOut | Delivery::Closed => {
                    debug!(
                        "Evicting subscriber {} on {} ({:?})",
                        subscriber.id, topic, outcome
                    );
                    self.evict(topic, subscriber).await;
                }
            }
        }
        delivered
    }

    async fn evict(&self, topic: &Topic, subscriber: &Subscriber) {
        {
            let mut topics = self.topics.write().await;
            remove_from(&mut topics, topic, subscriber.id);
        }
        subscriber.signal_close();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

fn remove_from(topics: &mut Registry, topic: &Topic, id: SubscriberId) -> Option<Subscriber> {
    let subs = topics.get_mut(topic)?;
    let removed = subs.remove(&id);
    if subs.is_empty() {
        topics.remove(topic);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodedash_common::UpdateStage;
    use tokio::time::Instant;

    fn complete(message: &str) -> HubEvent {
        HubEvent::UpdateComplete {
            message: message.to_string(),
        }
    }

    fn message_of(frame: &Frame) -> String {
        let value: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        value["message"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = EventHub::default();
        assert_eq!(hub.publish(&Topic::named("app"), &complete("x")).await, 0);
        assert_eq!(hub.publish_global(&complete("x")).await, 0);
    }

    #[tokio::test]
    async fn test_delivery_in_call_order() {
        let hub = EventHub::default();
        let topic = Topic::named("app-1");
        let (sub, mut mailbox) = Subscriber::new(8);
        hub.register(topic.clone(), sub).await;

        for i in 0..5 {
            assert_eq!(hub.publish(&topic, &complete(&i.to_string())).await, 1);
        }

        for i in 0..5 {
            let frame = mailbox.next().await.unwrap();
            assert_eq!(frame.kind, "update-complete");
            assert_eq!(message_of(&frame), i.to_string());
        }
        assert!(mailbox.try_next().is_none());
    }

    #[tokio::test]
    async fn test_publish_is_topic_scoped() {
        let hub = EventHub::default();
        let (a, mut mailbox_a) = Subscriber::new(4);
        let (b, mut mailbox_b) = Subscriber::new(4);
        hub.register(Topic::named("a"), a).await;
        hub.register(Topic::named("b"), b).await;

        hub.publish(&Topic::named("a"), &complete("only a")).await;

        assert_eq!(message_of(&mailbox_a.try_next().unwrap()), "only a");
        assert!(mailbox_b.try_next().is_none());
    }

    #[tokio::test]
    async fn test_global_reaches_every_topic() {
        let hub = EventHub::default();
        let (a, mut mailbox_a) = Subscriber::new(4);
        let (g, mut mailbox_g) = Subscriber::new(4);
        hub.register(Topic::named("a"), a).await;
        hub.register(Topic::Global, g).await;

        let event = HubEvent::UpdateProgress {
            stage: UpdateStage::Downloading,
            percentage: 25.0,
            message: "fetching".to_string(),
        };
        assert_eq!(hub.publish_global(&event).await, 2);
        assert_eq!(mailbox_a.try_next().unwrap().kind, "update-progress");
        assert_eq!(mailbox_g.try_next().unwrap().kind, "update-progress");
    }

    #[tokio::test(start_paused = true)]
    async fn test_undrained_subscriber_evicted_after_one_timeout() {
        let hub = EventHub::new(Duration::from_millis(500), Duration::from_millis(100));
        let topic = Topic::named("slow");
        let (sub, mut mailbox) = Subscriber::new(2);
        let id = sub.id();
        hub.register(topic.clone(), sub).await;

        // Two frames fit in the mailbox
        assert_eq!(hub.publish(&topic, &complete("1")).await, 1);
        assert_eq!(hub.publish(&topic, &complete("2")).await, 1);
        assert!(hub.is_registered(&topic, id).await);

        // Third one times out and evicts
        assert_eq!(hub.publish(&topic, &complete("3")).await, 0);
        assert!(!hub.is_registered(&topic, id).await);
        assert_eq!(hub.subscriber_count().await, 0);

        // Never delivered to again
        assert_eq!(hub.publish(&topic, &complete("4")).await, 0);
        assert_eq!(message_of(&mailbox.try_next().unwrap()), "1");
        assert_eq!(message_of(&mailbox.try_next().unwrap()), "2");
        assert!(mailbox.try_next().is_none());
        assert!(mailbox.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_does_not_starve_others() {
        let hub = EventHub::default();
        let topic = Topic::named("shared");
        let (slow, _slow_mailbox) = Subscriber::new(1);
        let (fast, mut fast_mailbox) = Subscriber::new(8);
        hub.register(topic.clone(), slow).await;
        hub.register(topic.clone(), fast).await;

        hub.publish(&topic, &complete("1")).await;
        assert_eq!(hub.publish(&topic, &complete("2")).await, 1);

        assert_eq!(hub.subscriber_count().await, 1);
        assert_eq!(message_of(&fast_mailbox.try_next().unwrap()), "1");
        assert_eq!(message_of(&fast_mailbox.try_next().unwrap()), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_stays_available_during_a_stalled_publish() {
        let hub = Arc::new(EventHub::new(
            Duration::from_millis(500),
            Duration::from_millis(100),
        ));
        let stalled = Topic::named("stalled");
        let (slow, _slow_mailbox) = Subscriber::new(1);
        let slow_id = slow.id();
        hub.register(stalled.clone(), slow).await;
        assert_eq!(hub.publish(&stalled, &complete("fill")).await, 1);

        let publishing = tokio::spawn({
            let hub = Arc::clone(&hub);
            let stalled = stalled.clone();
            async move { hub.publish(&stalled, &complete("stuck")).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!publishing.is_finished());

        let quick = Duration::from_millis(1);
        let other = Topic::named("other");
        let (sub, _mailbox) = Subscriber::new(1);
        let id = sub.id();
        tokio::time::timeout(quick, hub.register(other.clone(), sub))
            .await
            .unwrap();
        assert!(tokio::time::timeout(quick, hub.is_registered(&other, id))
            .await
            .unwrap());
        assert!(tokio::time::timeout(quick, hub.unregister(&other, id))
            .await
            .unwrap());

        assert_eq!(publishing.await.unwrap(), 0);
        assert!(!hub.is_registered(&stalled, slow_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_publish_gives_up_sooner() {
        let hub = EventHub::new(Duration::from_millis(500), Duration::from_millis(100));
        let topic = Topic::named("full");

        let (first, _first_mailbox) = Subscriber::new(1);
        hub.register(topic.clone(), first).await;
        hub.publish(&topic, &complete("fill")).await;

        let started = Instant::now();
        assert_eq!(hub.publish_global(&complete("global")).await, 0);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100), "{:?}", waited);
        assert!(waited < Duration::from_millis(500), "{:?}", waited);

        let (second, _second_mailbox) = Subscriber::new(1);
        hub.register(topic.clone(), second).await;
        hub.publish(&topic, &complete("fill")).await;

        let started = Instant::now();
        assert_eq!(hub.publish(&topic, &complete("topic")).await, 0);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_mailbox_is_evicted() {
        let hub = EventHub::default();
        let topic = Topic::named("gone");
        let (sub, mailbox) = Subscriber::new(4);
        hub.register(topic.clone(), sub).await;
        drop(mailbox);

        assert_eq!(hub.publish(&topic, &complete("x")).await, 0);
        assert!(hub.topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_never_evicts() {
        let hub = EventHub::default();
        let topic = Topic::named("idle");
        let (sub, mut mailbox) = Subscriber::new(1);
        let id = sub.id();
        hub.register(topic.clone(), sub).await;

        for _ in 0..10 {
            hub.heartbeat(&topic).await;
        }

        assert!(hub.is_registered(&topic, id).await);
        assert_eq!(mailbox.try_next().unwrap().kind, "heartbeat");
        assert!(mailbox.try_next().is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = EventHub::default();
        let topic = Topic::named("app");
        let (sub, _mailbox) = Subscriber::new(1);
        let id = sub.id();
        hub.register(topic.clone(), sub).await;

        assert!(hub.unregister(&topic, id).await);
        assert!(!hub.unregister(&topic, id).await);
        assert!(!hub.unregister(&Topic::named("never"), id).await);
        assert!(hub.topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_closure_signal_ends_mailbox() {
        let (sub, mut mailbox) = Subscriber::new(4);
        assert!(sub.offer(Frame::heartbeat()));
        sub.signal_close();
        sub.signal_close();
        assert!(mailbox.next().await.is_none());
    }
}
