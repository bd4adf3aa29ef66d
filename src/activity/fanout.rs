//! Bounded, drop-on-full event fan-out.
//!
//! Publishers push into an unbounded intake queue and return immediately.
//! One pump task moves each event into every subscriber's bounded buffer with
//! `try_send`; a full buffer drops the event for that subscriber only.
//! Events carry a sequence number so a subscriber never sees anything
//! published before it subscribed.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub id: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub published: u64,
    pub subscribers: Vec<SubscriberStats>,
}

struct Slot<T> {
    id: u64,
    /// First sequence number this subscriber receives
    since: u64,
    tx: flume::Sender<T>,
    delivered: u64,
    dropped: u64,
}

struct FanoutState<T> {
    slots: Vec<Slot<T>>,
    next_id: u64,
    published: u64,
}

pub struct Fanout<T> {
    name: &'static str,
    intake: flume::Sender<(u64, T)>,
    state: Arc<Mutex<FanoutState<T>>>,
    buffer: usize,
}

impl<T: Clone + Send + 'static> Fanout<T> {
    /// Spawn the pump on the current runtime. It stops when `shutdown` fires.
    pub fn new(name: &'static str, buffer: usize, shutdown: CancellationToken) -> Self {
        let (intake, rx) = flume::unbounded::<(u64, T)>();
        let state = Arc::new(Mutex::new(FanoutState {
            slots: Vec::new(),
            next_id: 1,
            published: 0,
        }));

        let pump_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv_async() => match received {
                        Ok((seq, event)) => deliver(&pump_state, seq, event),
                        Err(_) => break,
                    },
                }
            }
            // Closing every sender ends subscriber streams.
            pump_state.lock().slots.clear();
            debug!(fanout = name, "Fan-out pump stopped");
        });

        Self {
            name,
            intake,
            state,
            buffer: buffer.max(1),
        }
    }

    /// Non-blocking publish.
    pub fn publish(&self, event: T) {
        let mut state = self.state.lock();
        let seq = state.published;
        state.published += 1;
        // Sent under the lock so sequence order matches intake order.
        if self.intake.send((seq, event)).is_err() {
            warn!(fanout = self.name, "Fan-out pump is gone, event discarded");
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = flume::bounded(self.buffer);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let since = state.published;
        state.slots.push(Slot {
            id,
            since,
            tx,
            delivered: 0,
            dropped: 0,
        });
        Subscription { id, rx }
    }

    /// Remove a subscriber; its channel closes once drained.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|slot| slot.id != id);
        before != state.slots.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn stats(&self) -> FanoutStats {
        let state = self.state.lock();
        FanoutStats {
            published: state.published,
            subscribers: state
                .slots
                .iter()
                .map(|slot| SubscriberStats {
                    id: slot.id,
                    delivered: slot.delivered,
                    dropped: slot.dropped,
                })
                .collect(),
        }
    }
}

fn deliver<T: Clone>(state: &Mutex<FanoutState<T>>, seq: u64, event: T) {
    let mut state = state.lock();
    state.slots.retain_mut(|slot| {
        if seq < slot.since {
            return true;
        }
        match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                slot.delivered += 1;
                true
            }
            Err(flume::TrySendError::Full(_)) => {
                slot.dropped += 1;
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    });
}

/// Receiving side of one subscriber.
pub struct Subscription<T> {
    id: u64,
    rx: flume::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscriber was removed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: 'static,
    {
        self.rx.into_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_arrive_in_publication_order() {
        let fanout = Fanout::new("test", 16, CancellationToken::new());
        let sub = fanout.subscribe();

        for i in 0..10 {
            fanout.publish(i);
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_contained() {
        let fanout = Fanout::new("test", DEFAULT_SUBSCRIBER_BUFFER, CancellationToken::new());
        let fast = fanout.subscribe();
        let stalled = fanout.subscribe();
        let stalled_id = stalled.id();

        // The fast reader keeps up batch by batch; the stalled one never reads.
        let mut received = Vec::new();
        for batch in 0..10u32 {
            for i in 0..DEFAULT_SUBSCRIBER_BUFFER as u32 {
                fanout.publish(batch * DEFAULT_SUBSCRIBER_BUFFER as u32 + i);
            }
            for _ in 0..DEFAULT_SUBSCRIBER_BUFFER {
                let event = tokio::time::timeout(Duration::from_secs(1), fast.recv()).await.unwrap().unwrap();
                received.push(event);
            }
        }
        assert_eq!(received, (0..100).collect::<Vec<_>>());

        let prefix = stalled.drain();
        assert_eq!(prefix, (0..DEFAULT_SUBSCRIBER_BUFFER as u32).collect::<Vec<_>>());

        let stats = fanout.stats();
        assert_eq!(stats.published, 100);
        let stalled_stats = stats.subscribers.iter().find(|s| s.id == stalled_id).unwrap();
        assert_eq!(stalled_stats.delivered, DEFAULT_SUBSCRIBER_BUFFER as u64);
        assert_eq!(stalled_stats.dropped, 100 - DEFAULT_SUBSCRIBER_BUFFER as u64);
    }

    #[tokio::test]
    async fn test_late_subscriber_skips_earlier_events() {
        let fanout = Fanout::new("test", 8, CancellationToken::new());
        // Published before the pump has had a chance to run.
        fanout.publish(1u8);
        fanout.publish(2);
        let late = fanout.subscribe();
        fanout.publish(3);

        assert_eq!(tokio::time::timeout(Duration::from_secs(1), late.recv()).await.unwrap(), Some(3));
        assert!(late.try_recv().is_none());
        let stats = fanout.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.subscribers[0].delivered, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let fanout: Fanout<u8> = Fanout::new("test", 4, CancellationToken::new());
        let sub = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 1);

        assert!(fanout.unsubscribe(sub.id()));
        assert_eq!(fanout.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let fanout = Fanout::new("test", 4, CancellationToken::new());
        let kept = fanout.subscribe();
        drop(fanout.subscribe());

        fanout.publish(1);
        assert_eq!(tokio::time::timeout(Duration::from_secs(1), kept.recv()).await.unwrap(), Some(1));
        assert_eq!(fanout.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let token = CancellationToken::new();
        let fanout: Fanout<u8> = Fanout::new("test", 4, token.clone());
        let sub = fanout.subscribe();
        token.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().is_none());
    }
}
