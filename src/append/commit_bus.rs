//! The internal commit bus: fan-out of committed events to subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use crate::core::{EventNumber, EventRecord};

/// Message published for every committed event, in commit order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committed {
    pub event: EventRecord,
    /// First event number of the batch this event was committed in.
    pub first_event_number: EventNumber,
}

impl Committed {
    fn byte_len(&self) -> usize {
        self.event.data.len() + self.event.metadata.len()
    }
}

/// Why the bus dropped a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusDropReason {
    Overflow,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("commit bus subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },
    #[error("commit bus lock poisoned")]
    LockPoisoned,
}

/// Bounded per-subscriber queue fed by the append path. A subscriber that
/// stops draining is dropped with a sticky reason rather than stalling
/// commits.
pub struct BusSubscription {
    id: u64,
    receiver: Receiver<Committed>,
    queued_bytes: Arc<AtomicUsize>,
    drop_reason: Arc<Mutex<Option<BusDropReason>>>,
}

impl BusSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_recv(&self) -> Result<Committed, TryRecvError> {
        let message = self.receiver.try_recv()?;
        self.decrement_bytes(message.byte_len());
        Ok(message)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Committed, RecvTimeoutError> {
        let message = self.receiver.recv_timeout(timeout)?;
        self.decrement_bytes(message.byte_len());
        Ok(message)
    }

    pub fn drop_reason(&self) -> Option<BusDropReason> {
        self.drop_reason.lock().ok().and_then(|guard| *guard)
    }

    fn decrement_bytes(&self, amount: usize) {
        let prev = self.queued_bytes.fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(prev >= amount, "queued bytes underflow");
    }
}

struct SubscriberState {
    sender: Sender<Committed>,
    max_bytes: usize,
    queued_bytes: Arc<AtomicUsize>,
    drop_reason: Arc<Mutex<Option<BusDropReason>>>,
}

impl SubscriberState {
    fn set_drop_reason(&self, reason: BusDropReason) {
        if let Ok(mut guard) = self.drop_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
    }
}

struct BusState {
    max_subscribers: usize,
    next_subscriber_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

#[derive(Clone)]
pub struct CommitBus {
    inner: Arc<Mutex<BusState>>,
}

impl CommitBus {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState {
                max_subscribers,
                next_subscriber_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(
        &self,
        max_events: usize,
        max_bytes: usize,
    ) -> Result<BusSubscription, BusError> {
        let mut state = self.lock_state()?;
        if state.subscribers.len() >= state.max_subscribers {
            return Err(BusError::SubscriberLimitReached {
                max_subscribers: state.max_subscribers,
            });
        }

        let (sender, receiver) = crossbeam::channel::bounded(max_events.max(1));
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let drop_reason = Arc::new(Mutex::new(None));
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);
        state.subscribers.insert(
            id,
            SubscriberState {
                sender,
                max_bytes: max_bytes.max(1),
                queued_bytes: Arc::clone(&queued_bytes),
                drop_reason: Arc::clone(&drop_reason),
            },
        );

        Ok(BusSubscription {
            id,
            receiver,
            queued_bytes,
            drop_reason,
        })
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut state) = self.inner.lock() {
            state.subscribers.remove(&id);
        }
    }

    /// Deliver to every subscriber. Never blocks: a full or over-budget
    /// subscriber is removed with `Overflow`.
    pub fn publish(&self, message: Committed) -> Result<(), BusError> {
        let mut state = self.lock_state()?;
        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            let queued = subscriber.queued_bytes.load(Ordering::Acquire);
            if queued.saturating_add(message.byte_len()) > subscriber.max_bytes {
                subscriber.set_drop_reason(BusDropReason::Overflow);
                dropped.push(*id);
                continue;
            }
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {
                    subscriber
                        .queued_bytes
                        .fetch_add(message.byte_len(), Ordering::AcqRel);
                }
                Err(TrySendError::Full(_)) => {
                    subscriber.set_drop_reason(BusDropReason::Overflow);
                    dropped.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            state.subscribers.remove(&id);
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> Result<usize, BusError> {
        Ok(self.lock_state()?.subscribers.len())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BusState>, BusError> {
        self.inner.lock().map_err(|_| BusError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventId, LogPosition, StreamId};
    use bytes::Bytes;
    use uuid::Uuid;

    fn committed(n: i64, bytes: usize) -> Committed {
        Committed {
            event: EventRecord {
                stream: StreamId::parse("s").unwrap(),
                event_number: EventNumber::new(n).unwrap(),
                event_id: EventId::new(Uuid::from_bytes([n as u8 + 1; 16])),
                event_type: "t".to_string(),
                is_json: false,
                data: Bytes::from(vec![0u8; bytes.max(1)]),
                metadata: Bytes::new(),
                created_ms: 1_700_000_000_000,
                position: LogPosition::single(n * 100),
            },
            first_event_number: EventNumber::new(n).unwrap(),
        }
    }

    #[test]
    fn delivers_in_commit_order() {
        let bus = CommitBus::new(8);
        let sub = bus.subscribe(8, 1024).unwrap();
        bus.publish(committed(0, 4)).unwrap();
        bus.publish(committed(1, 4)).unwrap();

        assert_eq!(sub.try_recv().unwrap().event.event_number.get(), 0);
        assert_eq!(sub.try_recv().unwrap().event.event_number.get(), 1);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn overflow_drops_subscriber_with_reason() {
        let bus = CommitBus::new(8);
        let sub = bus.subscribe(1, 1024).unwrap();
        bus.publish(committed(0, 4)).unwrap();
        bus.publish(committed(1, 4)).unwrap();

        assert_eq!(sub.drop_reason(), Some(BusDropReason::Overflow));
        assert_eq!(bus.subscriber_count().unwrap(), 0);
    }

    #[test]
    fn byte_budget_enforced() {
        let bus = CommitBus::new(8);
        let sub = bus.subscribe(16, 10).unwrap();
        bus.publish(committed(0, 8)).unwrap();
        bus.publish(committed(1, 8)).unwrap();
        assert_eq!(sub.drop_reason(), Some(BusDropReason::Overflow));
    }

    #[test]
    fn subscriber_limit_enforced() {
        let bus = CommitBus::new(1);
        let _first = bus.subscribe(4, 64).unwrap();
        assert!(matches!(
            bus.subscribe(4, 64),
            Err(BusError::SubscriberLimitReached { .. })
        ));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = CommitBus::new(8);
        let sub = bus.subscribe(4, 64).unwrap();
        let id = sub.id();
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count().unwrap(), 0);
    }
}
