//! Group lifecycle (create/update/delete/connect) and consumer sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::append::{AppendCoordinator, CommitBus};
use crate::core::{
    EventId, EventNumber, ExpectedVersion, Limits, ProposedEvent, ResolvedEvent, StreamId,
};
use crate::reader::{Reader, StreamReadOutcome};
use crate::sub::DropReason;

use super::group::{run_group, GroupContext, GroupMsg};
use super::{
    NackAction, PersistentError, PersistentResult, PersistentSettings, CONFIG_EVENT_TYPE,
    CONFIG_STREAM,
};

/// Frames pushed to a connected consumer.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    EventAppeared {
        event: ResolvedEvent,
        retry_count: u32,
    },
    Dropped(DropReason),
}

/// A consumer's connection to a group.
pub struct ConsumerSession {
    consumer_id: u64,
    receiver: Receiver<SessionEvent>,
    mailbox: Sender<GroupMsg>,
    drop_delivered: AtomicBool,
}

impl ConsumerSession {
    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// Next frame, or `None` on timeout. A dead group synthesizes one final
    /// `Dropped` frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                if self.drop_delivered.swap(true, Ordering::AcqRel) {
                    None
                } else {
                    Some(SessionEvent::Dropped(DropReason::ConnectionClosed))
                }
            }
        }
    }

    pub fn ack(&self, ids: &[EventId]) -> PersistentResult<()> {
        self.mailbox
            .send(GroupMsg::Ack {
                consumer_id: self.consumer_id,
                ids: ids.to_vec(),
            })
            .map_err(|_| PersistentError::Shutdown)
    }

    pub fn nack(&self, ids: &[EventId], action: NackAction) -> PersistentResult<()> {
        self.mailbox
            .send(GroupMsg::Nack {
                consumer_id: self.consumer_id,
                ids: ids.to_vec(),
                action,
            })
            .map_err(|_| PersistentError::Shutdown)
    }

    pub fn close(&self) {
        let _ = self.mailbox.send(GroupMsg::Disconnect {
            consumer_id: self.consumer_id,
        });
    }
}

impl Drop for ConsumerSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConfigAction {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigEvent {
    action: ConfigAction,
    stream: StreamId,
    group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<PersistentSettings>,
}

struct GroupHandle {
    mailbox: Sender<GroupMsg>,
    worker: Option<JoinHandle<()>>,
    settings: PersistentSettings,
}

type GroupKey = (StreamId, String);

/// The competing-consumer engine: owns one dispatcher per (stream, group).
pub struct PersistentSubscriptions {
    reader: Arc<Reader>,
    appender: Arc<AppendCoordinator>,
    bus: CommitBus,
    limits: Limits,
    groups: Mutex<HashMap<GroupKey, GroupHandle>>,
}

impl PersistentSubscriptions {
    pub fn new(
        reader: Arc<Reader>,
        appender: Arc<AppendCoordinator>,
        bus: CommitBus,
        limits: Limits,
    ) -> Self {
        Self {
            reader,
            appender,
            bus,
            limits,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild groups from the configuration stream and resume each from its
    /// checkpoint.
    pub fn recover(&self) -> PersistentResult<usize> {
        let config_stream = StreamId::parse(CONFIG_STREAM).expect("static stream name");
        let mut surviving: HashMap<GroupKey, PersistentSettings> = HashMap::new();
        let mut from = EventNumber::ZERO;
        loop {
            let outcome = self.reader.read_stream_forward(
                &config_stream,
                from,
                self.limits.read_batch_size,
                false,
            )?;
            let slice = match outcome {
                StreamReadOutcome::Slice(slice) => slice,
                _ => break,
            };
            for resolved in &slice.events {
                if resolved.event.event_type != CONFIG_EVENT_TYPE {
                    continue;
                }
                let Ok(config) = serde_json::from_slice::<ConfigEvent>(&resolved.event.data)
                else {
                    continue;
                };
                let key = (config.stream, config.group);
                match (config.action, config.settings) {
                    (ConfigAction::Deleted, _) => {
                        surviving.remove(&key);
                    }
                    (_, Some(settings)) => {
                        surviving.insert(key, settings);
                    }
                    (_, None) => {}
                }
            }
            match slice.next_event_number {
                Some(next) if !slice.is_end_of_stream => from = next,
                _ => break,
            }
        }

        let mut groups = self.lock_groups()?;
        let count = surviving.len();
        for ((stream, group), settings) in surviving {
            let handle = self.spawn(&stream, &group, settings);
            groups.insert((stream, group), handle);
        }
        if count > 0 {
            tracing::info!(groups = count, "persistent subscriptions recovered");
        }
        Ok(count)
    }

    pub fn create(
        &self,
        stream: &StreamId,
        group: &str,
        settings: PersistentSettings,
    ) -> PersistentResult<()> {
        settings.validate()?;
        let mut groups = self.lock_groups()?;
        let key = (stream.clone(), group.to_string());
        if groups.contains_key(&key) {
            return Err(PersistentError::GroupExists {
                stream: stream.clone(),
                group: group.to_string(),
            });
        }
        self.persist_config(ConfigAction::Created, stream, group, Some(&settings))?;
        let handle = self.spawn(stream, group, settings);
        groups.insert(key, handle);
        tracing::info!(stream = %stream, group, "persistent subscription created");
        Ok(())
    }

    /// Replace a group's settings. The dispatcher restarts and resumes from
    /// its last checkpoint.
    pub fn update(
        &self,
        stream: &StreamId,
        group: &str,
        settings: PersistentSettings,
    ) -> PersistentResult<()> {
        settings.validate()?;
        let mut groups = self.lock_groups()?;
        let key = (stream.clone(), group.to_string());
        let Some(mut handle) = groups.remove(&key) else {
            return Err(PersistentError::GroupNotFound {
                stream: stream.clone(),
                group: group.to_string(),
            });
        };
        self.persist_config(ConfigAction::Updated, stream, group, Some(&settings))?;
        stop_handle(&mut handle, GroupMsg::Shutdown);
        let handle = self.spawn(stream, group, settings);
        groups.insert(key, handle);
        tracing::info!(stream = %stream, group, "persistent subscription updated");
        Ok(())
    }

    pub fn delete(&self, stream: &StreamId, group: &str) -> PersistentResult<()> {
        let mut groups = self.lock_groups()?;
        let key = (stream.clone(), group.to_string());
        let Some(mut handle) = groups.remove(&key) else {
            return Err(PersistentError::GroupNotFound {
                stream: stream.clone(),
                group: group.to_string(),
            });
        };
        self.persist_config(ConfigAction::Deleted, stream, group, None)?;
        stop_handle(&mut handle, GroupMsg::Delete);
        tracing::info!(stream = %stream, group, "persistent subscription deleted");
        Ok(())
    }

    /// Join a group as a competing consumer.
    pub fn connect(
        &self,
        stream: &StreamId,
        group: &str,
        consumer_name: &str,
    ) -> PersistentResult<ConsumerSession> {
        let (mailbox, capacity) = {
            let groups = self.lock_groups()?;
            let key = (stream.clone(), group.to_string());
            let Some(handle) = groups.get(&key) else {
                return Err(PersistentError::GroupNotFound {
                    stream: stream.clone(),
                    group: group.to_string(),
                });
            };
            (handle.mailbox.clone(), handle.settings.consumer_capacity)
        };

        let (sender, receiver) = crossbeam::channel::bounded(capacity + 4);
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        mailbox
            .send(GroupMsg::Connect {
                name: consumer_name.to_string(),
                sender,
                reply: reply_tx,
            })
            .map_err(|_| PersistentError::Shutdown)?;
        let consumer_id = reply_rx
            .recv_timeout(Duration::from_millis(self.limits.operation_timeout_ms))
            .map_err(|_| PersistentError::OperationTimeout)??;

        Ok(ConsumerSession {
            consumer_id,
            receiver,
            mailbox,
            drop_delivered: AtomicBool::new(false),
        })
    }

    /// Stop every group dispatcher. Errors on one group never affect the
    /// others.
    pub fn shutdown(&self) {
        let mut groups = match self.groups.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let count = groups.len();
        for (_, mut handle) in groups.drain() {
            stop_handle(&mut handle, GroupMsg::Shutdown);
        }
        if count > 0 {
            tracing::info!(groups = count, "persistent subscription engine stopped");
        }
    }

    fn spawn(&self, stream: &StreamId, group: &str, settings: PersistentSettings) -> GroupHandle {
        let (mailbox_tx, mailbox_rx) = crossbeam::channel::unbounded();
        let ctx = GroupContext {
            stream: stream.clone(),
            group: group.to_string(),
            settings: settings.clone(),
            reader: Arc::clone(&self.reader),
            appender: Arc::clone(&self.appender),
            bus: self.bus.clone(),
            limits: self.limits.clone(),
            mailbox: mailbox_rx,
        };
        let worker = std::thread::Builder::new()
            .name(format!("psub-{}::{}", stream.as_str(), group))
            .spawn(move || run_group(ctx))
            .expect("spawn persistent subscription worker");
        GroupHandle {
            mailbox: mailbox_tx,
            worker: Some(worker),
            settings,
        }
    }

    fn persist_config(
        &self,
        action: ConfigAction,
        stream: &StreamId,
        group: &str,
        settings: Option<&PersistentSettings>,
    ) -> PersistentResult<()> {
        let config_stream = StreamId::parse(CONFIG_STREAM).expect("static stream name");
        let body = serde_json::to_vec(&ConfigEvent {
            action,
            stream: stream.clone(),
            group: group.to_string(),
            settings: settings.cloned(),
        })
        .map_err(|err| PersistentError::SettingsInvalid {
            reason: err.to_string(),
        })?;
        let event = ProposedEvent::json(
            EventId::generate(),
            CONFIG_EVENT_TYPE,
            bytes::Bytes::from(body),
        );
        self.appender
            .append(&config_stream, ExpectedVersion::Any, &[event])?;
        Ok(())
    }

    fn lock_groups(
        &self,
    ) -> PersistentResult<std::sync::MutexGuard<'_, HashMap<GroupKey, GroupHandle>>> {
        self.groups.lock().map_err(|_| PersistentError::LockPoisoned)
    }
}

fn stop_handle(handle: &mut GroupHandle, message: GroupMsg) {
    let _ = handle.mailbox.send(message);
    if let Some(worker) = handle.worker.take() {
        let _ = worker.join();
    }
}
