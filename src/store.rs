//! Node wiring: build the components leaves-first, shut down in reverse.

use std::path::Path;
use std::sync::Arc;

use crate::append::{AppendCoordinator, AppendOutcome, CommitBus, DeleteOutcome};
use crate::config::Config;
use crate::core::{
    CurrentVersion, EventNumber, ExpectedVersion, FilterSpec, LogPosition, ProposedEvent,
    StreamId, StreamMetadata,
};
use crate::index::{catch_up_index, StreamIndex};
use crate::log::{ChunkedLog, RecoveryReport};
use crate::psub::{ConsumerSession, PersistentSettings, PersistentSubscriptions};
use crate::reader::{AllSlice, ReadEventResult, Reader, StreamReadOutcome};
use crate::sub::{Subscription, SubscriptionDispatcher};

/// An open event store. The value is the process-wide context: construct
/// once, thread it explicitly, shut down in reverse order of construction.
pub struct EventStore {
    index: Arc<StreamIndex>,
    appender: Arc<AppendCoordinator>,
    reader: Arc<Reader>,
    dispatcher: SubscriptionDispatcher,
    persistent: PersistentSubscriptions,
    recovery: RecoveryReport,
}

impl EventStore {
    /// Open (or create) a store under `dir`: recover the log tail, repair
    /// the index from the log, and resume persistent subscription groups.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> crate::Result<Self> {
        let dir = dir.as_ref();

        let (log, recovery) = ChunkedLog::open(&dir.join("chunks"), &config.limits)?;
        let log_reader = log.reader();

        let index = Arc::new(StreamIndex::open(
            &dir.join("index"),
            &config.limits,
            Arc::new(log_reader.clone()),
        )?);
        let covered = index.covered_to()?;
        let end = log_reader.end_position();
        if covered < end {
            catch_up_index(
                &log_reader,
                &index,
                covered.max(log_reader.start_position()),
                end,
            )?;
        }

        let bus = CommitBus::new(config.limits.max_subscribers);
        let appender = Arc::new(AppendCoordinator::new(
            log,
            Arc::clone(&index),
            bus.clone(),
            &config.durability,
            &config.limits,
        ));
        let reader = Arc::new(Reader::new(
            log_reader,
            Arc::clone(&index),
            config.limits.clone(),
        ));
        let dispatcher =
            SubscriptionDispatcher::new(bus.clone(), Arc::clone(&reader), config.limits.clone());
        let persistent = PersistentSubscriptions::new(
            Arc::clone(&reader),
            Arc::clone(&appender),
            bus,
            config.limits.clone(),
        );
        persistent.recover()?;

        Ok(Self {
            index,
            appender,
            reader,
            dispatcher,
            persistent,
            recovery,
        })
    }

    /// What the startup scan found and repaired.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ----- writes -----

    pub fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[ProposedEvent],
    ) -> crate::Result<AppendOutcome> {
        Ok(self.appender.append(stream, expected, events)?)
    }

    pub fn delete_stream(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        hard: bool,
    ) -> crate::Result<DeleteOutcome> {
        Ok(self.appender.delete_stream(stream, expected, hard)?)
    }

    pub fn set_stream_metadata(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> crate::Result<AppendOutcome> {
        Ok(self.appender.set_stream_metadata(stream, expected, metadata)?)
    }

    /// fsync outstanding writes (batched durability mode).
    pub fn flush(&self) -> crate::Result<()> {
        Ok(self.appender.flush()?)
    }

    // ----- reads -----

    pub fn read_event(
        &self,
        stream: &StreamId,
        event_number: EventNumber,
        resolve_links: bool,
    ) -> crate::Result<ReadEventResult> {
        Ok(self.reader.read_event(stream, event_number, resolve_links)?)
    }

    pub fn read_stream_forward(
        &self,
        stream: &StreamId,
        from: EventNumber,
        count: usize,
        resolve_links: bool,
    ) -> crate::Result<StreamReadOutcome> {
        Ok(self
            .reader
            .read_stream_forward(stream, from, count, resolve_links)?)
    }

    pub fn read_stream_backward(
        &self,
        stream: &StreamId,
        from: EventNumber,
        count: usize,
        resolve_links: bool,
    ) -> crate::Result<StreamReadOutcome> {
        Ok(self
            .reader
            .read_stream_backward(stream, from, count, resolve_links)?)
    }

    pub fn read_all_forward(
        &self,
        from: LogPosition,
        max_count: usize,
        filter: Option<&FilterSpec>,
        max_search_window: usize,
    ) -> crate::Result<AllSlice> {
        let compiled = match filter {
            Some(spec) => Some(crate::core::EventFilter::compile(spec).map_err(|err| {
                crate::sub::SubscriptionError::Filter(err)
            })?),
            None => None,
        };
        Ok(self
            .reader
            .read_all_forward(from, max_count, compiled.as_ref(), max_search_window)?)
    }

    pub fn read_all_backward(
        &self,
        from: LogPosition,
        max_count: usize,
        filter: Option<&FilterSpec>,
        max_search_window: usize,
    ) -> crate::Result<AllSlice> {
        let compiled = match filter {
            Some(spec) => Some(crate::core::EventFilter::compile(spec).map_err(|err| {
                crate::sub::SubscriptionError::Filter(err)
            })?),
            None => None,
        };
        Ok(self
            .reader
            .read_all_backward(from, max_count, compiled.as_ref(), max_search_window)?)
    }

    pub fn stream_metadata(&self, stream: &StreamId) -> crate::Result<StreamMetadata> {
        Ok(self.reader.stream_metadata(stream)?)
    }

    pub fn stream_tail(&self, stream: &StreamId) -> crate::Result<CurrentVersion> {
        Ok(self.index.tail(stream)?)
    }

    /// Exclusive end of the readable log.
    pub fn head_position(&self) -> LogPosition {
        self.reader.end_position()
    }

    // ----- subscriptions -----

    pub fn subscribe_stream_live(
        &self,
        stream: &StreamId,
        resolve_links: bool,
    ) -> crate::Result<Subscription> {
        Ok(self.dispatcher.subscribe_stream_live(stream, resolve_links)?)
    }

    pub fn subscribe_all_live(&self, filter: Option<&FilterSpec>) -> crate::Result<Subscription> {
        Ok(self.dispatcher.subscribe_all_live(filter)?)
    }

    /// Catch-up subscription on a stream, starting just past `from`.
    pub fn subscribe_stream_from(
        &self,
        stream: &StreamId,
        from: Option<EventNumber>,
        resolve_links: bool,
    ) -> crate::Result<Subscription> {
        Ok(self
            .dispatcher
            .subscribe_stream_from(stream, from, resolve_links)?)
    }

    /// Filtered catch-up over the global order with periodic checkpoints.
    pub fn subscribe_all_from(
        &self,
        from: Option<LogPosition>,
        filter: Option<&FilterSpec>,
        checkpoint_interval: usize,
    ) -> crate::Result<Subscription> {
        Ok(self
            .dispatcher
            .subscribe_all_from(from, filter, checkpoint_interval)?)
    }

    // ----- persistent subscriptions -----

    pub fn create_persistent_subscription(
        &self,
        stream: &StreamId,
        group: &str,
        settings: PersistentSettings,
    ) -> crate::Result<()> {
        Ok(self.persistent.create(stream, group, settings)?)
    }

    pub fn update_persistent_subscription(
        &self,
        stream: &StreamId,
        group: &str,
        settings: PersistentSettings,
    ) -> crate::Result<()> {
        Ok(self.persistent.update(stream, group, settings)?)
    }

    pub fn delete_persistent_subscription(
        &self,
        stream: &StreamId,
        group: &str,
    ) -> crate::Result<()> {
        Ok(self.persistent.delete(stream, group)?)
    }

    pub fn connect_persistent_subscription(
        &self,
        stream: &StreamId,
        group: &str,
        consumer_name: &str,
    ) -> crate::Result<ConsumerSession> {
        Ok(self.persistent.connect(stream, group, consumer_name)?)
    }

    /// Stop components in reverse construction order and flush state.
    pub fn shutdown(self) -> crate::Result<()> {
        self.persistent.shutdown();
        self.dispatcher.shutdown();
        self.appender.shutdown()?;
        Ok(())
    }
}
