//! Subscription registration and the live-only delivery workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Sender;

use crate::append::{BusSubscription, CommitBus};
use crate::core::{EventFilter, EventNumber, FilterSpec, Limits, LogPosition, StreamId};
use crate::reader::Reader;

use super::catchup::{run_catch_up_all, run_catch_up_stream, CatchUpShared};
use super::{
    forward, DropReason, SubResult, Subscription, SubscriptionControl, SubscriptionEvent,
};

const LIVE_POLL: Duration = Duration::from_millis(20);

/// Creates and tracks subscriptions; one worker thread per subscription.
pub struct SubscriptionDispatcher {
    bus: CommitBus,
    reader: Arc<Reader>,
    limits: Limits,
    next_id: AtomicU64,
    registry: Mutex<HashMap<u64, Arc<SubscriptionControl>>>,
}

impl SubscriptionDispatcher {
    pub fn new(bus: CommitBus, reader: Arc<Reader>, limits: Limits) -> Self {
        Self {
            bus,
            reader,
            limits,
            next_id: AtomicU64::new(1),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Live subscription to one stream: every commit after registration.
    pub fn subscribe_stream_live(
        &self,
        stream: &StreamId,
        resolve_links: bool,
    ) -> SubResult<Subscription> {
        let stream = stream.clone();
        self.spawn_live(move |committed| committed.event.stream == stream, resolve_links)
    }

    /// Live subscription to the "all" order with an optional filter.
    pub fn subscribe_all_live(&self, filter: Option<&FilterSpec>) -> SubResult<Subscription> {
        let filter = match filter {
            Some(spec) => EventFilter::compile(spec)?,
            None => EventFilter::match_all(),
        };
        self.spawn_live(
            move |committed| filter.matches_record(&committed.event),
            false,
        )
    }

    /// Catch-up subscription to a stream: history from past `from`, then
    /// live push. `None` starts at the beginning.
    pub fn subscribe_stream_from(
        &self,
        stream: &StreamId,
        from: Option<EventNumber>,
        resolve_links: bool,
    ) -> SubResult<Subscription> {
        let (sender, receiver) =
            crossbeam::channel::bounded(self.limits.subscription_queue_events);
        let control = SubscriptionControl::new();
        let id = self.register(&control)?;
        let shared = self.shared(control.clone(), sender);
        let stream = stream.clone();
        let worker = std::thread::Builder::new()
            .name(format!("sub-catchup-{id}"))
            .spawn(move || run_catch_up_stream(shared, stream, from, resolve_links))
            .expect("spawn subscription worker");
        Ok(Subscription::new(id, receiver, control, worker))
    }

    /// Filtered catch-up over "all", emitting periodic checkpoints so
    /// clients can advance cursors across long non-matching ranges.
    pub fn subscribe_all_from(
        &self,
        from: Option<LogPosition>,
        filter: Option<&FilterSpec>,
        checkpoint_interval: usize,
    ) -> SubResult<Subscription> {
        let filter = match filter {
            Some(spec) => Some(EventFilter::compile(spec)?),
            None => None,
        };
        let (sender, receiver) =
            crossbeam::channel::bounded(self.limits.subscription_queue_events);
        let control = SubscriptionControl::new();
        let id = self.register(&control)?;
        let shared = self.shared(control.clone(), sender);
        let worker = std::thread::Builder::new()
            .name(format!("sub-catchup-all-{id}"))
            .spawn(move || run_catch_up_all(shared, from, filter, checkpoint_interval))
            .expect("spawn subscription worker");
        Ok(Subscription::new(id, receiver, control, worker))
    }

    /// Stop every subscription worker. Handles already returned to callers
    /// observe `Dropped(ConnectionClosed)`.
    pub fn shutdown(&self) {
        let registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        for control in registry.values() {
            control.set_drop_reason(DropReason::ConnectionClosed);
            control.cancel();
        }
        tracing::info!(subscriptions = registry.len(), "subscription dispatcher stopped");
    }

    fn spawn_live<F>(&self, matches: F, resolve_links: bool) -> SubResult<Subscription>
    where
        F: Fn(&crate::append::Committed) -> bool + Send + 'static,
    {
        let bus_sub = self.bus.subscribe(
            self.limits.subscription_queue_events,
            self.limits.subscription_queue_bytes,
        )?;
        let (sender, receiver) =
            crossbeam::channel::bounded(self.limits.subscription_queue_events);
        let control = SubscriptionControl::new();
        let id = self.register(&control)?;

        let worker_control = control.clone();
        let reader = Arc::clone(&self.reader);
        let deadline = Duration::from_millis(self.limits.operation_timeout_ms);
        let worker = std::thread::Builder::new()
            .name(format!("sub-live-{id}"))
            .spawn(move || {
                run_live(
                    bus_sub,
                    sender,
                    worker_control,
                    reader,
                    matches,
                    resolve_links,
                    deadline,
                )
            })
            .expect("spawn subscription worker");
        Ok(Subscription::new(id, receiver, control, worker))
    }

    fn shared(
        &self,
        control: Arc<SubscriptionControl>,
        sender: Sender<SubscriptionEvent>,
    ) -> CatchUpShared {
        CatchUpShared {
            reader: Arc::clone(&self.reader),
            bus: self.bus.clone(),
            control,
            sender,
            limits: self.limits.clone(),
        }
    }

    fn register(&self, control: &Arc<SubscriptionControl>) -> SubResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| super::SubscriptionError::LockPoisoned)?;
        registry.retain(|_, control| !control.is_cancelled());
        registry.insert(id, Arc::clone(control));
        Ok(id)
    }
}

/// Live-only worker: drain the bus, filter, push. Exactly once per
/// subscription, in commit order.
fn run_live<F>(
    bus_sub: BusSubscription,
    sender: Sender<SubscriptionEvent>,
    control: Arc<SubscriptionControl>,
    reader: Arc<Reader>,
    matches: F,
    resolve_links: bool,
    deadline: Duration,
) where
    F: Fn(&crate::append::Committed) -> bool,
{
    loop {
        if control.is_cancelled() {
            return;
        }
        if bus_sub.drop_reason().is_some() {
            // The bus already cut us off for lagging.
            control.set_drop_reason(DropReason::SubscriberMaxCountReached);
            return;
        }
        let committed = match bus_sub.recv_timeout(LIVE_POLL) {
            Ok(committed) => committed,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                control.set_drop_reason(
                    control
                        .drop_reason()
                        .unwrap_or(DropReason::SubscriberMaxCountReached),
                );
                return;
            }
        };
        if !matches(&committed) {
            continue;
        }
        let resolved = match reader.resolve(committed.event, resolve_links) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(error = %err, "live delivery failed to resolve event");
                control.set_drop_reason(DropReason::ServerError);
                return;
            }
        };
        if let Err(reason) = forward(
            &sender,
            &control,
            SubscriptionEvent::EventAppeared(resolved),
            deadline,
        ) {
            control.set_drop_reason(reason);
            return;
        }
    }
}
