//! Subscriptions: live tail, catch-up, and filtered all-stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::append::BusError;
use crate::core::filter::FilterError;
use crate::core::{LogPosition, ResolvedEvent};
use crate::error::Transience;
use crate::reader::ReadError;

mod catchup;
mod dispatcher;

pub use dispatcher::SubscriptionDispatcher;

pub type SubResult<T> = Result<T, SubscriptionError>;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("subscription registry lock poisoned")]
    LockPoisoned,
}

impl SubscriptionError {
    pub fn transience(&self) -> Transience {
        match self {
            SubscriptionError::Bus(BusError::SubscriberLimitReached { .. }) => {
                Transience::Retryable
            }
            SubscriptionError::Bus(_) => Transience::Permanent,
            SubscriptionError::Read(err) => err.transience(),
            SubscriptionError::Filter(_) => Transience::Permanent,
            SubscriptionError::LockPoisoned => Transience::Permanent,
        }
    }
}

/// Why a subscription stopped, as pushed to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    SubscriberMaxCountReached,
    ProcessingQueueOverflow,
    ServerError,
    ConnectionClosed,
}

/// Push frames delivered to a subscriber.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    EventAppeared(ResolvedEvent),
    Checkpoint(LogPosition),
    LiveProcessingStarted,
    Dropped(DropReason),
}

pub(crate) struct SubscriptionControl {
    cancelled: AtomicBool,
    drop_reason: Mutex<Option<DropReason>>,
}

impl SubscriptionControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            drop_reason: Mutex::new(None),
        })
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn set_drop_reason(&self, reason: DropReason) {
        if let Ok(mut guard) = self.drop_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
    }

    pub(crate) fn drop_reason(&self) -> Option<DropReason> {
        self.drop_reason.lock().ok().and_then(|guard| *guard)
    }
}

/// Client handle to a subscription. Events arrive through [`Subscription::recv_timeout`];
/// when the feed ends, a single `Dropped` frame carries the reason.
pub struct Subscription {
    id: u64,
    receiver: Receiver<SubscriptionEvent>,
    control: Arc<SubscriptionControl>,
    worker: Mutex<Option<JoinHandle<()>>>,
    drop_delivered: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        receiver: Receiver<SubscriptionEvent>,
        control: Arc<SubscriptionControl>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            receiver,
            control,
            worker: Mutex::new(Some(worker)),
            drop_delivered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame, or `None` on timeout. After the worker stops, exactly one
    /// `Dropped` frame is synthesized, then `None` forever.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SubscriptionEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                if self.drop_delivered.swap(true, Ordering::AcqRel) {
                    None
                } else {
                    Some(SubscriptionEvent::Dropped(
                        self.control
                            .drop_reason()
                            .unwrap_or(DropReason::ConnectionClosed),
                    ))
                }
            }
        }
    }

    /// The reason the feed stopped, once it has.
    pub fn drop_reason(&self) -> Option<DropReason> {
        self.control.drop_reason()
    }

    /// Idempotent; joins the worker, so no frame is delivered after this
    /// returns.
    pub fn unsubscribe(&self) {
        self.control.set_drop_reason(DropReason::Unsubscribed);
        self.control.cancel();
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.control.set_drop_reason(DropReason::ConnectionClosed);
        self.control.cancel();
    }
}

/// Deliver one frame with back-pressure, polling for cancellation. A full
/// queue past the deadline or a gone receiver ends the subscription.
pub(crate) fn forward(
    sender: &Sender<SubscriptionEvent>,
    control: &SubscriptionControl,
    event: SubscriptionEvent,
    deadline: Duration,
) -> Result<(), DropReason> {
    let started = Instant::now();
    let mut event = event;
    loop {
        if control.is_cancelled() {
            return Err(DropReason::Unsubscribed);
        }
        match sender.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(_)) => return Err(DropReason::ConnectionClosed),
            Err(TrySendError::Full(back)) => {
                if started.elapsed() >= deadline {
                    return Err(DropReason::SubscriberMaxCountReached);
                }
                event = back;
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
}
