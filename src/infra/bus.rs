use crate::domain::{Event, Topic};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// What happens when a subscriber's buffer is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Overflow {
    /// Discard the incoming event.
    #[default]
    Drop,
    /// Discard the oldest queued event to make room.
    DropOldest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscribeOptions {
    pub buffer: usize,
    pub overflow: Overflow,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_SUBSCRIBER_BUFFER,
            overflow: Overflow::Drop,
        }
    }
}

impl SubscribeOptions {
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn overflow(mut self, overflow: Overflow) -> Self {
        self.overflow = overflow;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

#[derive(Debug)]
struct Queue {
    options: SubscribeOptions,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Queue {
    fn new(options: SubscribeOptions, closed: bool) -> Self {
        Self {
            options,
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(options.buffer),
                closed,
            }),
            ready: Condvar::new(),
        }
    }

    /// Returns true when an event was discarded.
    fn offer(&self, event: Event) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        let mut dropped = false;
        if state.events.len() >= self.options.buffer {
            match self.options.overflow {
                Overflow::Drop => return true,
                Overflow::DropOldest => {
                    state.events.pop_front();
                    dropped = true;
                }
            }
        }
        state.events.push_back(event);
        drop(state);
        self.ready.notify_one();
        dropped
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }
}

/// Receiving end of a subscription. Queued events stay readable after the dispatcher closes.
#[derive(Debug)]
pub struct Subscription {
    topic: Option<Topic>,
    queue: Arc<Queue>,
}

impl Subscription {
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }

    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        let mut state = self.queue.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.events.pop_front() {
            Some(event) => Ok(event),
            None if state.closed => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Blocks until an event arrives; `None` once closed and drained.
    pub fn recv(&self) -> Option<Event> {
        let mut state = self.queue.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            state = self.queue.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvTimeoutError::Timeout);
            }
            state = self
                .queue
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<Event> {
        let mut state = self.queue.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.queue
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }
}

/// Topic-keyed fan-out with a bounded buffer per subscriber. Publishing never blocks.
#[derive(Debug, Default)]
pub struct Dispatcher {
    topics: RwLock<HashMap<Topic, Vec<Weak<Queue>>>>,
    closed: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_with(topic, SubscribeOptions::default())
    }

    pub fn subscribe_with(&self, topic: Topic, options: SubscribeOptions) -> Subscription {
        let options = SubscribeOptions::default()
            .buffer(options.buffer)
            .overflow(options.overflow);
        if self.closed.load(Ordering::Acquire) {
            return Subscription {
                topic: Some(topic),
                queue: Arc::new(Queue::new(options, true)),
            };
        }

        let queue = Arc::new(Queue::new(options, false));
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        // Close may have won the race for the lock.
        if self.closed.load(Ordering::Acquire) {
            queue.close();
        } else {
            let subscribers = topics.entry(topic).or_default();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.push(Arc::downgrade(&queue));
        }
        Subscription {
            topic: Some(topic),
            queue,
        }
    }

    pub fn publish(&self, topic: Topic, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = topics.get(&topic) else {
            return;
        };
        self.deliver(subscribers, &event);
    }

    /// Delivers to every subscriber of every topic.
    pub fn publish_all(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        for subscribers in topics.values() {
            self.deliver(subscribers, &event);
        }
    }

    fn deliver(&self, subscribers: &[Weak<Queue>], event: &Event) {
        for queue in subscribers.iter().filter_map(Weak::upgrade) {
            if queue.offer(event.clone()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %event.topic, kind = %event.kind, "bus event dropped");
            }
        }
    }

    /// Closes every subscription. Later subscribes get closed streams and publishes are ignored.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        for queue in topics.values().flatten().filter_map(Weak::upgrade) {
            queue.close();
        }
        topics.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BusStats {
        let subscribers = self
            .topics
            .read()
            .map(|topics| {
                topics
                    .values()
                    .flatten()
                    .filter(|weak| weak.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0);
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventData;
    use std::thread;

    fn seq(n: u64) -> Event {
        Event::new(Topic::GitChange, "test", EventData::Sequence(n))
    }

    fn sequences(events: Vec<Event>) -> Vec<u64> {
        events
            .into_iter()
            .map(|event| match event.data {
                EventData::Sequence(n) => n,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn drop_oldest_keeps_the_newest_events() {
        let bus = Dispatcher::new();
        let sub = bus.subscribe_with(
            Topic::GitChange,
            SubscribeOptions::default()
                .buffer(5)
                .overflow(Overflow::DropOldest),
        );
        for n in 0..10 {
            bus.publish(Topic::GitChange, seq(n));
        }

        assert_eq!(sequences(sub.drain()), vec![5, 6, 7, 8, 9]);
        let stats = bus.stats();
        assert_eq!(stats.published, 10);
        assert_eq!(stats.dropped, 5);
    }

    #[test]
    fn drop_discards_new_events_when_full() {
        let bus = Dispatcher::new();
        let sub = bus.subscribe_with(Topic::GitChange, SubscribeOptions::default().buffer(3));
        for n in 0..7 {
            bus.publish(Topic::GitChange, seq(n));
        }
        assert_eq!(sequences(sub.drain()), vec![0, 1, 2]);
        assert_eq!(bus.stats().dropped, 4);
    }

    #[test]
    fn closed_dispatcher_yields_closed_streams_and_ignores_publishes() {
        let bus = Dispatcher::new();
        let before = bus.subscribe(Topic::ConfigChange);
        bus.publish(Topic::ConfigChange, seq(1));
        bus.close();
        bus.close();

        assert_eq!(before.recv().map(|e| e.data), Some(EventData::Sequence(1)));
        assert_eq!(before.recv(), None);

        let after = bus.subscribe(Topic::ConfigChange);
        assert!(after.is_closed());
        assert_eq!(after.try_recv(), Err(TryRecvError::Disconnected));

        bus.publish(Topic::ConfigChange, seq(2));
        bus.publish_all(seq(3));
        assert_eq!(bus.stats().published, 1);
    }

    #[test]
    fn topics_are_isolated_and_publish_all_fans_out() {
        let bus = Dispatcher::new();
        let git = bus.subscribe(Topic::GitChange);
        let config = bus.subscribe(Topic::ConfigChange);

        bus.publish(Topic::GitChange, seq(1));
        assert_eq!(config.try_recv(), Err(TryRecvError::Empty));
        assert!(git.try_recv().is_ok());

        bus.publish_all(seq(2));
        assert!(git.try_recv().is_ok());
        assert!(config.try_recv().is_ok());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = Dispatcher::new();
        let kept = bus.subscribe(Topic::AdapterWatch);
        drop(bus.subscribe(Topic::AdapterWatch));
        assert_eq!(bus.stats().subscribers, 1);
        bus.publish(Topic::AdapterWatch, seq(1));
        assert_eq!(bus.stats().dropped, 0);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn concurrent_publishers_preserve_per_publisher_order() {
        let bus = Arc::new(Dispatcher::new());
        let sub = bus.subscribe_with(Topic::GitChange, SubscribeOptions::default().buffer(4096));

        let handles = (0..4u64)
            .map(|worker| {
                let bus = bus.clone();
                thread::spawn(move || {
                    for n in 0..200u64 {
                        bus.publish(Topic::GitChange, seq(worker * 1000 + n));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let received = sequences(sub.drain());
        assert_eq!(received.len(), 800);
        for worker in 0..4u64 {
            let own = received
                .iter()
                .filter(|n| **n / 1000 == worker)
                .copied()
                .collect::<Vec<_>>();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn recv_timeout_wakes_on_publish() {
        let bus = Arc::new(Dispatcher::new());
        let sub = bus.subscribe(Topic::ProjectSwitch);
        assert_eq!(
            sub.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
        let publisher = {
            let bus = bus.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bus.publish(Topic::ProjectSwitch, seq(7));
            })
        };
        let event = sub.recv_timeout(Duration::from_secs(2)).expect("event");
        assert_eq!(event.data, EventData::Sequence(7));
        publisher.join().expect("join");
    }
}
