//! Per-group dispatcher: buffering, consumer strategies, delivery tracking,
//! and checkpointing. One worker thread per (stream, group).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::append::{AppendCoordinator, BusSubscription, CommitBus};
use crate::core::{
    CurrentVersion, EventId, EventNumber, ExpectedVersion, Limits, ProposedEvent, ResolvedEvent,
    StreamId,
};
use crate::reader::{Reader, StreamReadOutcome};
use crate::sub::DropReason;

use super::engine::SessionEvent;
use super::{
    checkpoint_stream, parked_stream, ConsumerStrategy, NackAction, PersistentError,
    PersistentSettings, CHECKPOINT_EVENT_TYPE,
};

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointBody {
    checkpoint: i64,
}

pub(crate) enum GroupMsg {
    Connect {
        name: String,
        sender: Sender<SessionEvent>,
        reply: Sender<Result<u64, PersistentError>>,
    },
    Disconnect {
        consumer_id: u64,
    },
    Ack {
        consumer_id: u64,
        ids: Vec<EventId>,
    },
    Nack {
        consumer_id: u64,
        ids: Vec<EventId>,
        action: NackAction,
    },
    Shutdown,
    Delete,
}

pub(crate) struct GroupContext {
    pub stream: StreamId,
    pub group: String,
    pub settings: PersistentSettings,
    pub reader: Arc<Reader>,
    pub appender: Arc<AppendCoordinator>,
    pub bus: CommitBus,
    pub limits: Limits,
    pub mailbox: Receiver<GroupMsg>,
}

struct Consumer {
    id: u64,
    name: String,
    sender: Sender<SessionEvent>,
    in_flight: usize,
}

struct Buffered {
    event: ResolvedEvent,
    retry_count: u32,
}

struct InFlight {
    event: ResolvedEvent,
    event_number: i64,
    retry_count: u32,
    consumer_id: u64,
    deadline: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventStatus {
    Outstanding,
    Acked,
    Parked,
    Skipped,
}

impl EventStatus {
    fn is_terminal(self) -> bool {
        !matches!(self, EventStatus::Outstanding)
    }
}

struct GroupWorker {
    ctx: GroupContext,
    bus_sub: Option<BusSubscription>,
    cursor: EventNumber,
    stream_gone: bool,
    buffer: VecDeque<Buffered>,
    in_flight: HashMap<EventId, InFlight>,
    statuses: BTreeMap<i64, EventStatus>,
    consumers: Vec<Consumer>,
    next_consumer_id: u64,
    round_robin_cursor: usize,
    checkpointed: i64,
    processed_since_checkpoint: u64,
    last_checkpoint_at: Instant,
    dispatch_stopped: bool,
}

pub(crate) fn run_group(ctx: GroupContext) {
    let mut worker = match GroupWorker::init(ctx) {
        Ok(worker) => worker,
        Err(err) => {
            tracing::error!(error = %err, "persistent subscription group failed to start");
            return;
        }
    };
    worker.run();
}

impl GroupWorker {
    fn init(ctx: GroupContext) -> Result<Self, PersistentError> {
        let (checkpointed, cursor) = load_start_point(&ctx)?;
        let bus_sub = ctx
            .bus
            .subscribe(
                ctx.settings.live_buffer_size.max(1),
                ctx.limits.subscription_queue_bytes,
            )
            .ok();
        tracing::info!(
            stream = %ctx.stream,
            group = %ctx.group,
            cursor = cursor.get(),
            "persistent subscription group started"
        );
        Ok(Self {
            ctx,
            bus_sub,
            cursor,
            stream_gone: false,
            buffer: VecDeque::new(),
            in_flight: HashMap::new(),
            statuses: BTreeMap::new(),
            consumers: Vec::new(),
            next_consumer_id: 1,
            round_robin_cursor: 0,
            checkpointed,
            processed_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            dispatch_stopped: false,
        })
    }

    fn run(&mut self) {
        let tick = Duration::from_millis(self.ctx.limits.tick_interval_ms.max(1));
        loop {
            match self.ctx.mailbox.recv_timeout(tick) {
                Ok(GroupMsg::Connect {
                    name,
                    sender,
                    reply,
                }) => {
                    let result = self.connect(name, sender);
                    let _ = reply.send(result);
                }
                Ok(GroupMsg::Disconnect { consumer_id }) => {
                    self.remove_consumer(consumer_id, None, true);
                }
                Ok(GroupMsg::Ack { consumer_id, ids }) => self.ack(consumer_id, &ids),
                Ok(GroupMsg::Nack {
                    consumer_id,
                    ids,
                    action,
                }) => self.nack(consumer_id, &ids, action),
                Ok(GroupMsg::Shutdown) => {
                    self.maybe_checkpoint(true);
                    self.drop_all_consumers(DropReason::ConnectionClosed);
                    return;
                }
                Ok(GroupMsg::Delete) => {
                    self.drop_all_consumers(DropReason::PersistentSubscriptionDeleted);
                    tracing::info!(
                        stream = %self.ctx.stream,
                        group = %self.ctx.group,
                        "persistent subscription group deleted"
                    );
                    return;
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    self.maybe_checkpoint(true);
                    self.drop_all_consumers(DropReason::ConnectionClosed);
                    return;
                }
            }

            self.drain_bus();
            self.expire_in_flight();
            self.fill_buffer();
            self.dispatch();
            self.maybe_checkpoint(false);
        }
    }

    fn connect(
        &mut self,
        name: String,
        sender: Sender<SessionEvent>,
    ) -> Result<u64, PersistentError> {
        let max = self.ctx.settings.max_subscribers;
        if max > 0 && self.consumers.len() >= max {
            return Err(PersistentError::MaxSubscribersReached {
                stream: self.ctx.stream.clone(),
                group: self.ctx.group.clone(),
                max,
            });
        }
        let id = self.next_consumer_id;
        self.next_consumer_id += 1;
        tracing::debug!(
            stream = %self.ctx.stream,
            group = %self.ctx.group,
            consumer = %name,
            "consumer connected"
        );
        self.consumers.push(Consumer {
            id,
            name,
            sender,
            in_flight: 0,
        });
        Ok(id)
    }

    /// Remove a consumer; with `requeue`, its in-flight events return to the
    /// buffer (no retry increment) for redistribution.
    fn remove_consumer(&mut self, consumer_id: u64, reason: Option<DropReason>, requeue: bool) {
        let Some(idx) = self.consumers.iter().position(|c| c.id == consumer_id) else {
            return;
        };
        let consumer = self.consumers.remove(idx);
        if self.round_robin_cursor > idx {
            self.round_robin_cursor -= 1;
        }
        if let Some(reason) = reason {
            let _ = consumer.sender.try_send(SessionEvent::Dropped(reason));
        }
        if requeue {
            let mut reclaimed: Vec<InFlight> = Vec::new();
            self.in_flight.retain(|_, entry| {
                if entry.consumer_id == consumer_id {
                    reclaimed.push(InFlight {
                        event: entry.event.clone(),
                        event_number: entry.event_number,
                        retry_count: entry.retry_count,
                        consumer_id: entry.consumer_id,
                        deadline: entry.deadline,
                    });
                    false
                } else {
                    true
                }
            });
            reclaimed.sort_by_key(|entry| entry.event_number);
            for entry in reclaimed.into_iter().rev() {
                self.buffer.push_front(Buffered {
                    event: entry.event,
                    retry_count: entry.retry_count,
                });
            }
        }
        tracing::debug!(
            stream = %self.ctx.stream,
            group = %self.ctx.group,
            consumer = %consumer.name,
            "consumer removed"
        );
    }

    fn drop_all_consumers(&mut self, reason: DropReason) {
        for consumer in self.consumers.drain(..) {
            let _ = consumer.sender.try_send(SessionEvent::Dropped(reason));
        }
        self.in_flight.clear();
    }

    fn ack(&mut self, _consumer_id: u64, ids: &[EventId]) {
        for id in ids {
            let Some(entry) = self.in_flight.remove(id) else {
                continue;
            };
            self.decrement_consumer(entry.consumer_id);
            self.statuses.insert(entry.event_number, EventStatus::Acked);
            self.processed_since_checkpoint += 1;
        }
    }

    fn nack(&mut self, _consumer_id: u64, ids: &[EventId], action: NackAction) {
        for id in ids {
            let Some(entry) = self.in_flight.remove(id) else {
                continue;
            };
            self.decrement_consumer(entry.consumer_id);
            match action {
                NackAction::Retry => self.retry(entry),
                NackAction::Park => self.park(entry),
                NackAction::Skip => {
                    self.statuses
                        .insert(entry.event_number, EventStatus::Skipped);
                    self.processed_since_checkpoint += 1;
                }
                NackAction::Stop => {
                    // Stop dispatching entirely; the event returns to the
                    // buffer uncounted and consumers are detached.
                    self.buffer.push_front(Buffered {
                        event: entry.event,
                        retry_count: entry.retry_count,
                    });
                    self.dispatch_stopped = true;
                }
            }
        }
        if self.dispatch_stopped {
            tracing::warn!(
                stream = %self.ctx.stream,
                group = %self.ctx.group,
                "dispatch stopped by consumer nack"
            );
            self.drop_all_consumers(DropReason::Unsubscribed);
        }
    }

    fn retry(&mut self, mut entry: InFlight) {
        entry.retry_count += 1;
        if entry.retry_count > self.ctx.settings.max_retries {
            self.park(entry);
        } else {
            self.buffer.push_front(Buffered {
                event: entry.event,
                retry_count: entry.retry_count,
            });
        }
    }

    /// Move an event to the park stream; the checkpoint may advance past it
    /// but it is never replayed automatically.
    fn park(&mut self, entry: InFlight) {
        let record = &entry.event.event;
        let parked = ProposedEvent {
            event_id: record.event_id,
            event_type: record.event_type.clone(),
            is_json: record.is_json,
            data: record.data.clone(),
            metadata: record.metadata.clone(),
        };
        let target = parked_stream(&self.ctx.stream, &self.ctx.group);
        match self
            .ctx
            .appender
            .append(&target, ExpectedVersion::Any, &[parked])
        {
            Ok(_) => {
                tracing::debug!(
                    stream = %self.ctx.stream,
                    group = %self.ctx.group,
                    event_number = entry.event_number,
                    retries = entry.retry_count,
                    "event parked"
                );
                self.statuses
                    .insert(entry.event_number, EventStatus::Parked);
                self.processed_since_checkpoint += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, "park append failed; event requeued");
                self.buffer.push_front(Buffered {
                    event: entry.event,
                    retry_count: entry.retry_count,
                });
            }
        }
    }

    fn decrement_consumer(&mut self, consumer_id: u64) {
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.id == consumer_id) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
    }

    /// Message-timeout expiry counts as a retry nack.
    fn expire_in_flight(&mut self) {
        let now = Instant::now();
        let expired: Vec<EventId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                self.decrement_consumer(entry.consumer_id);
                self.retry(entry);
            }
        }
    }

    /// The bus is a wake signal; reads from the log are the source of truth,
    /// so an overflowed bus subscription is simply replaced.
    fn drain_bus(&mut self) {
        let replace = match &self.bus_sub {
            Some(sub) => {
                while sub.try_recv().is_ok() {}
                sub.drop_reason().is_some()
            }
            None => true,
        };
        if replace {
            self.bus_sub = self
                .ctx
                .bus
                .subscribe(
                    self.ctx.settings.live_buffer_size.max(1),
                    self.ctx.limits.subscription_queue_bytes,
                )
                .ok();
        }
    }

    fn fill_buffer(&mut self) {
        if self.stream_gone || self.buffer.len() >= self.ctx.settings.history_buffer_size {
            return;
        }
        let outcome = match self.ctx.reader.read_stream_forward(
            &self.ctx.stream,
            self.cursor,
            self.ctx.settings.read_batch_size,
            self.ctx.settings.resolve_links,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, stream = %self.ctx.stream, "group read failed");
                return;
            }
        };
        match outcome {
            StreamReadOutcome::NoStream => {}
            StreamReadOutcome::StreamDeleted => {
                self.stream_gone = true;
                self.drop_all_consumers(DropReason::NotFound);
            }
            StreamReadOutcome::Slice(slice) => {
                for event in slice.events {
                    let number = event.original_event_number();
                    if number < self.cursor {
                        continue;
                    }
                    self.statuses
                        .entry(number.get())
                        .or_insert(EventStatus::Outstanding);
                    self.cursor = number.next();
                    self.buffer.push_back(Buffered {
                        event,
                        retry_count: 0,
                    });
                }
                if let Some(next) = slice.next_event_number {
                    self.cursor = self.cursor.max(next);
                }
            }
        }
    }

    fn dispatch(&mut self) {
        if self.dispatch_stopped || self.consumers.is_empty() {
            return;
        }
        let mut blocked_correlations: HashSet<u64> = HashSet::new();
        let mut i = 0;
        while i < self.buffer.len() {
            let target = match self.ctx.settings.strategy {
                ConsumerStrategy::RoundRobin => self.pick_round_robin(),
                ConsumerStrategy::DispatchToSingle => self.pick_single(),
                ConsumerStrategy::Pinned => {
                    let correlation = correlation_hash(&self.buffer[i].event);
                    if blocked_correlations.contains(&correlation) {
                        i += 1;
                        continue;
                    }
                    match self.pick_pinned(correlation) {
                        PinnedPick::Consumer(idx) => Some(idx),
                        PinnedPick::Busy => {
                            blocked_correlations.insert(correlation);
                            i += 1;
                            continue;
                        }
                        PinnedPick::NoConsumers => None,
                    }
                }
            };
            let Some(idx) = target else {
                return;
            };

            let buffered = self.buffer.remove(i).expect("index in bounds");
            if !self.deliver(idx, buffered) {
                // Consumer vanished mid-dispatch; retry next tick.
                return;
            }
        }
    }

    /// Returns false when the consumer had to be removed.
    fn deliver(&mut self, idx: usize, buffered: Buffered) -> bool {
        let consumer = &mut self.consumers[idx];
        let event_id = buffered.event.event.event_id;
        let event_number = buffered.event.original_event_number().get();
        match consumer.sender.try_send(SessionEvent::EventAppeared {
            event: buffered.event.clone(),
            retry_count: buffered.retry_count,
        }) {
            Ok(()) => {
                consumer.in_flight += 1;
                let consumer_id = consumer.id;
                self.in_flight.insert(
                    event_id,
                    InFlight {
                        event: buffered.event,
                        event_number,
                        retry_count: buffered.retry_count,
                        consumer_id,
                        deadline: Instant::now()
                            + Duration::from_millis(self.ctx.settings.message_timeout_ms),
                    },
                );
                true
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                let consumer_id = consumer.id;
                self.buffer.push_front(buffered);
                self.remove_consumer(consumer_id, None, true);
                false
            }
        }
    }

    fn pick_round_robin(&mut self) -> Option<usize> {
        let len = self.consumers.len();
        for offset in 0..len {
            let idx = (self.round_robin_cursor + offset) % len;
            if self.consumers[idx].in_flight < self.ctx.settings.consumer_capacity {
                self.round_robin_cursor = (idx + 1) % len;
                return Some(idx);
            }
        }
        None
    }

    fn pick_single(&self) -> Option<usize> {
        let first = self.consumers.first()?;
        (first.in_flight < self.ctx.settings.consumer_capacity).then_some(0)
    }

    fn pick_pinned(&self, correlation: u64) -> PinnedPick {
        if self.consumers.is_empty() {
            return PinnedPick::NoConsumers;
        }
        let idx = (correlation % self.consumers.len() as u64) as usize;
        if self.consumers[idx].in_flight < self.ctx.settings.consumer_capacity {
            PinnedPick::Consumer(idx)
        } else {
            PinnedPick::Busy
        }
    }

    /// The checkpoint is the greatest event number with every event at or
    /// below it acked, parked, or skipped.
    fn maybe_checkpoint(&mut self, force: bool) {
        let mut candidate = self.checkpointed;
        while let Some(status) = self.statuses.get(&(candidate + 1)) {
            if status.is_terminal() {
                candidate += 1;
            } else {
                break;
            }
        }
        if candidate <= self.checkpointed {
            return;
        }

        let settings = &self.ctx.settings;
        let due = (self.processed_since_checkpoint >= settings.min_checkpoint_count
            && self.last_checkpoint_at.elapsed()
                >= Duration::from_millis(settings.checkpoint_after_ms))
            || self.processed_since_checkpoint >= settings.max_checkpoint_count
            || force;
        if !due {
            return;
        }

        let body = match serde_json::to_vec(&CheckpointBody {
            checkpoint: candidate,
        }) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "checkpoint body serialization failed");
                return;
            }
        };
        let event = ProposedEvent::json(
            EventId::generate(),
            CHECKPOINT_EVENT_TYPE,
            bytes::Bytes::from(body),
        );
        let target = checkpoint_stream(&self.ctx.stream, &self.ctx.group);
        match self
            .ctx
            .appender
            .append(&target, ExpectedVersion::Any, &[event])
        {
            Ok(_) => {
                self.statuses = self.statuses.split_off(&(candidate + 1));
                self.checkpointed = candidate;
                self.processed_since_checkpoint = 0;
                self.last_checkpoint_at = Instant::now();
                tracing::debug!(
                    stream = %self.ctx.stream,
                    group = %self.ctx.group,
                    checkpoint = candidate,
                    "checkpoint persisted"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint append failed");
            }
        }
    }
}

enum PinnedPick {
    Consumer(usize),
    Busy,
    NoConsumers,
}

/// Correlation identity for pinning: the `$correlationId` metadata field
/// when present, the event id otherwise.
fn correlation_hash(event: &ResolvedEvent) -> u64 {
    let record = &event.event;
    let digest = if let Ok(metadata) =
        serde_json::from_slice::<serde_json::Value>(&record.metadata)
    {
        if let Some(correlation) = metadata.get("$correlationId").and_then(|v| v.as_str()) {
            Sha256::digest(correlation.as_bytes())
        } else {
            Sha256::digest(record.event_id.as_uuid().as_bytes())
        }
    } else {
        Sha256::digest(record.event_id.as_uuid().as_bytes())
    };
    u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"))
}

/// Latest persisted checkpoint, or the configured start point.
fn load_start_point(ctx: &GroupContext) -> Result<(i64, EventNumber), PersistentError> {
    let chk_stream = checkpoint_stream(&ctx.stream, &ctx.group);
    if let CurrentVersion::Version(tail) = ctx.reader.stream_tail(&chk_stream)? {
        let mut number = Some(tail);
        while let Some(current) = number {
            match ctx.reader.read_event(&chk_stream, current, false)? {
                crate::reader::ReadEventResult::Found(resolved) => {
                    if resolved.event.event_type == CHECKPOINT_EVENT_TYPE {
                        if let Ok(body) =
                            serde_json::from_slice::<CheckpointBody>(&resolved.event.data)
                        {
                            let cursor = EventNumber::new(body.checkpoint + 1)
                                .unwrap_or(EventNumber::ZERO);
                            return Ok((body.checkpoint, cursor));
                        }
                    }
                }
                _ => {}
            }
            number = current.prev();
        }
    }

    let cursor = match ctx.settings.start_from {
        super::StartFrom::Beginning => EventNumber::ZERO,
        super::StartFrom::EventNumber(n) => n,
        super::StartFrom::Live => match ctx.reader.stream_tail(&ctx.stream)? {
            CurrentVersion::Version(tail) => tail.next(),
            _ => EventNumber::ZERO,
        },
    };
    Ok((cursor.get() - 1, cursor))
}
