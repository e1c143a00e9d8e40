//! Catch-up workers: historical replay, gap drain, then live push.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender};

use crate::append::CommitBus;
use crate::core::{
    EventFilter, EventNumber, Limits, LogPosition, ResolvedEvent, StreamId,
};
use crate::reader::{Reader, StreamReadOutcome};

use super::{forward, DropReason, SubscriptionControl, SubscriptionEvent};

const LIVE_POLL: Duration = Duration::from_millis(20);

pub(crate) struct CatchUpShared {
    pub reader: Arc<Reader>,
    pub bus: CommitBus,
    pub control: Arc<SubscriptionControl>,
    pub sender: Sender<SubscriptionEvent>,
    pub limits: Limits,
}

impl CatchUpShared {
    fn deadline(&self) -> Duration {
        Duration::from_millis(self.limits.operation_timeout_ms)
    }

    fn push(&self, event: SubscriptionEvent) -> Result<(), DropReason> {
        forward(&self.sender, &self.control, event, self.deadline())
    }

    fn finish(&self, reason: DropReason) {
        self.control.set_drop_reason(reason);
    }
}

/// Catch-up on one stream. `from` is the subscriber's last handled event;
/// delivery starts just past it.
pub(crate) fn run_catch_up_stream(
    shared: CatchUpShared,
    stream: StreamId,
    from: Option<EventNumber>,
    resolve_links: bool,
) {
    let mut next = from.map(|n| n.next()).unwrap_or(EventNumber::ZERO);

    // Reading: replay history until the first end-of-stream.
    next = match read_stream_until_end(&shared, &stream, next, resolve_links) {
        Ok(next) => next,
        Err(Some(reason)) => return shared.finish(reason),
        Err(None) => return,
    };

    // CatchingUpLive: subscribe first, then close the gap so nothing falls
    // between history and the live feed.
    let bus_sub = match shared.bus.subscribe(
        shared.limits.live_buffer_size,
        shared.limits.subscription_queue_bytes,
    ) {
        Ok(sub) => sub,
        Err(err) => {
            tracing::warn!(error = %err, stream = %stream, "catch-up bus subscribe failed");
            return shared.finish(DropReason::ServerError);
        }
    };
    next = match read_stream_until_end(&shared, &stream, next, resolve_links) {
        Ok(next) => next,
        Err(Some(reason)) => return shared.finish(reason),
        Err(None) => return,
    };

    if shared.push(SubscriptionEvent::LiveProcessingStarted).is_err() {
        return shared.finish(DropReason::ConnectionClosed);
    }
    tracing::debug!(stream = %stream, from = next.get(), "catch-up subscription live");

    // Live: forward bus events, discarding anything at or below the
    // catch-up boundary.
    loop {
        if shared.control.is_cancelled() {
            return;
        }
        if bus_sub.drop_reason().is_some() {
            return shared.finish(DropReason::ProcessingQueueOverflow);
        }
        let committed = match bus_sub.recv_timeout(LIVE_POLL) {
            Ok(committed) => committed,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return shared.finish(DropReason::ProcessingQueueOverflow)
            }
        };
        if committed.event.stream != stream {
            continue;
        }
        if committed.event.event_number < next {
            continue;
        }
        next = committed.event.event_number.next();
        let resolved = match shared.reader.resolve(committed.event, resolve_links) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(error = %err, "catch-up failed to resolve live event");
                return shared.finish(DropReason::ServerError);
            }
        };
        if let Err(reason) = shared.push(SubscriptionEvent::EventAppeared(resolved)) {
            return shared.finish(reason);
        }
    }
}

/// Forward stream slices until `is_end_of_stream`. Returns the next event
/// number to continue from; `Err(None)` means cancellation.
fn read_stream_until_end(
    shared: &CatchUpShared,
    stream: &StreamId,
    mut next: EventNumber,
    resolve_links: bool,
) -> Result<EventNumber, Option<DropReason>> {
    loop {
        if shared.control.is_cancelled() {
            return Err(None);
        }
        let outcome = shared
            .reader
            .read_stream_forward(stream, next, shared.limits.read_batch_size, resolve_links)
            .map_err(|err| {
                tracing::warn!(error = %err, stream = %stream, "catch-up read failed");
                Some(DropReason::ServerError)
            })?;
        match outcome {
            StreamReadOutcome::NoStream => return Ok(next),
            StreamReadOutcome::StreamDeleted => return Err(Some(DropReason::NotFound)),
            StreamReadOutcome::Slice(slice) => {
                for event in slice.events {
                    // An event may land in both the final read and the live
                    // buffer; the number bound keeps delivery exactly-once.
                    if event.original_event_number() < next {
                        continue;
                    }
                    next = event.original_event_number().next();
                    shared
                        .push(SubscriptionEvent::EventAppeared(event))
                        .map_err(Some)?;
                }
                if let Some(n) = slice.next_event_number {
                    next = next.max(n);
                }
                if slice.is_end_of_stream {
                    return Ok(next);
                }
            }
        }
    }
}

/// Filtered catch-up over the global order with periodic checkpoints.
pub(crate) fn run_catch_up_all(
    shared: CatchUpShared,
    from: Option<LogPosition>,
    filter: Option<EventFilter>,
    checkpoint_interval: usize,
) {
    let mut last_delivered = from;
    let mut position = from.unwrap_or(LogPosition::START);

    // Reading.
    position = match read_all_until_end(
        &shared,
        position,
        &mut last_delivered,
        filter.as_ref(),
        checkpoint_interval,
    ) {
        Ok(position) => position,
        Err(Some(reason)) => return shared.finish(reason),
        Err(None) => return,
    };

    // CatchingUpLive.
    let bus_sub = match shared.bus.subscribe(
        shared.limits.live_buffer_size,
        shared.limits.subscription_queue_bytes,
    ) {
        Ok(sub) => sub,
        Err(err) => {
            tracing::warn!(error = %err, "catch-up bus subscribe failed");
            return shared.finish(DropReason::ServerError);
        }
    };
    position = match read_all_until_end(
        &shared,
        position,
        &mut last_delivered,
        filter.as_ref(),
        checkpoint_interval,
    ) {
        Ok(position) => position,
        Err(Some(reason)) => return shared.finish(reason),
        Err(None) => return,
    };

    // The boundary checkpoint covers every record examined during catch-up.
    if checkpoint_interval > 0
        && shared.push(SubscriptionEvent::Checkpoint(position)).is_err()
    {
        return shared.finish(DropReason::ConnectionClosed);
    }
    if shared.push(SubscriptionEvent::LiveProcessingStarted).is_err() {
        return shared.finish(DropReason::ConnectionClosed);
    }

    // Live.
    let mut examined = 0usize;
    loop {
        if shared.control.is_cancelled() {
            return;
        }
        if bus_sub.drop_reason().is_some() {
            return shared.finish(DropReason::ProcessingQueueOverflow);
        }
        let committed = match bus_sub.recv_timeout(LIVE_POLL) {
            Ok(committed) => committed,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return shared.finish(DropReason::ProcessingQueueOverflow)
            }
        };
        examined += 1;
        let event_position = committed.event.position;
        let duplicate = last_delivered
            .map(|bound| event_position <= bound)
            .unwrap_or(false);
        let matches = filter
            .as_ref()
            .map(|f| f.matches_record(&committed.event))
            .unwrap_or(true);
        if !duplicate && matches {
            last_delivered = Some(event_position);
            if let Err(reason) = shared.push(SubscriptionEvent::EventAppeared(
                ResolvedEvent::direct(committed.event),
            )) {
                return shared.finish(reason);
            }
        }
        // Checkpoints flow even across long non-matching ranges.
        if checkpoint_interval > 0 && examined % checkpoint_interval == 0 {
            if let Err(reason) = shared.push(SubscriptionEvent::Checkpoint(event_position)) {
                return shared.finish(reason);
            }
        }
    }
}

/// Forward filtered all-slices until end of log, checkpointing per examined
/// window. Returns the resume position.
fn read_all_until_end(
    shared: &CatchUpShared,
    mut position: LogPosition,
    last_delivered: &mut Option<LogPosition>,
    filter: Option<&EventFilter>,
    checkpoint_interval: usize,
) -> Result<LogPosition, Option<DropReason>> {
    let window = if checkpoint_interval > 0 {
        checkpoint_interval
    } else {
        shared.limits.max_search_window
    };
    loop {
        if shared.control.is_cancelled() {
            return Err(None);
        }
        let slice = shared
            .reader
            .read_all_forward(position, shared.limits.read_batch_size, filter, window)
            .map_err(|err| {
                tracing::warn!(error = %err, "catch-up all read failed");
                Some(DropReason::ServerError)
            })?;
        for event in slice.events {
            if last_delivered
                .map(|bound| event.position <= bound)
                .unwrap_or(false)
            {
                continue;
            }
            *last_delivered = Some(event.position);
            shared
                .push(SubscriptionEvent::EventAppeared(ResolvedEvent::direct(event)))
                .map_err(Some)?;
        }
        position = slice.next_position;
        if slice.is_end_of_stream {
            return Ok(position);
        }
        if checkpoint_interval > 0 {
            shared
                .push(SubscriptionEvent::Checkpoint(position))
                .map_err(Some)?;
        }
    }
}
