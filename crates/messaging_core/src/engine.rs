use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{MessageId, ThreadId, UserId},
    protocol::{MessagePayload, PageParams},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    api::MessagingApi,
    config::SyncConfig,
    error::SendError,
    live::{InboundMessageSink, LiveSubscriber, LiveTransport, SubscriptionState},
    message_store::{MessageStore, ReceiveOutcome},
    thread_directory::{ThreadDirectory, UpsertOutcome},
    types::{Attachment, AttachmentSource, Draft, Message, MessageEntry, Thread},
};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ThreadsUpdated(Vec<Thread>),
    MessagesUpdated { thread_id: ThreadId },
    ScrollToLatest { thread_id: ThreadId },
    /// A send was rolled back; the draft goes back into the compose box.
    SendFailed { draft: Draft, reason: String },
    /// Something the user should see.
    Error(String),
}

#[derive(Default)]
struct EngineState {
    store: MessageStore,
    directory: ThreadDirectory,
    open_thread: Option<ThreadId>,
    refresh_scheduled: bool,
}

/// Keeps threads and messages consistent across optimistic sends, REST
/// responses, push events and the periodic poll.
pub struct ConversationEngine {
    api: Arc<dyn MessagingApi>,
    live: LiveSubscriber,
    self_id: UserId,
    config: SyncConfig,
    inner: Mutex<EngineState>,
    poller: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl ConversationEngine {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        transport: Arc<dyn LiveTransport>,
        self_id: UserId,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let live = LiveSubscriber::new(
            transport,
            config.connect_retry_interval,
            config.connect_max_attempts,
        );
        Arc::new(Self {
            api,
            live,
            self_id,
            config,
            inner: Mutex::new(EngineState::default()),
            poller: Mutex::new(None),
            events,
        })
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn threads(&self) -> Vec<Thread> {
        self.inner.lock().await.directory.threads().to_vec()
    }

    pub async fn messages(&self, thread_id: &ThreadId) -> Vec<MessageEntry> {
        self.inner.lock().await.store.get(thread_id).to_vec()
    }

    pub async fn open_thread_id(&self) -> Option<ThreadId> {
        self.inner.lock().await.open_thread.clone()
    }

    pub async fn subscription_state(&self) -> SubscriptionState {
        self.live.state().await
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Fetches the thread list. `silent` is for background refreshes: errors
    /// are only logged.
    pub async fn load_threads(&self, silent: bool) -> Result<Vec<Thread>> {
        let summaries = match self.api.list_threads().await {
            Ok(summaries) => summaries,
            Err(err) => {
                if silent {
                    warn!("threads: background refresh failed: {err:#}");
                } else {
                    error!("threads: load failed: {err:#}");
                    self.emit(EngineEvent::Error(format!(
                        "Failed to load conversations: {err}"
                    )));
                }
                return Err(err.context("failed to load threads"));
            }
        };

        let fetched: Vec<Thread> = summaries.into_iter().map(Thread::from).collect();
        let (changed, snapshot) = {
            let mut guard = self.inner.lock().await;
            let changed = guard.directory.replace_if_changed(fetched);
            (changed, guard.directory.threads().to_vec())
        };

        if changed {
            debug!(count = snapshot.len(), silent, "threads: directory replaced");
            self.emit(EngineEvent::ThreadsUpdated(snapshot.clone()));
        }
        Ok(snapshot)
    }

    /// Refetches the directory after the configured delay. Calls made while
    /// a refresh is already scheduled are folded into it.
    fn schedule_thread_refresh(self: &Arc<Self>, state: &mut EngineState) {
        if state.refresh_scheduled {
            return;
        }
        state.refresh_scheduled = true;
        let engine = Arc::clone(self);
        let delay = self.config.thread_refresh_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.inner.lock().await.refresh_scheduled = false;
            let _ = engine.load_threads(true).await;
        });
    }

    /// Makes `thread_id` the open thread: moves the live subscription to it,
    /// fetches its messages and marks the counterpart's messages read.
    pub async fn open_thread(self: &Arc<Self>, thread_id: ThreadId) -> Result<Vec<MessageEntry>> {
        self.inner.lock().await.open_thread = Some(thread_id.clone());
        self.live
            .select(thread_id.clone(), Arc::new(EngineSink(Arc::downgrade(self))))
            .await;

        let page = PageParams {
            page: 1,
            per_page: self.config.message_page_size,
        };
        let fetched = match self.api.list_messages(&thread_id, page).await {
            Ok(fetched) => fetched,
            Err(err) => {
                error!(thread_id = %thread_id, "messages: load failed: {err:#}");
                self.emit(EngineEvent::Error(format!("Failed to load messages: {err}")));
                return Err(err.context(format!("failed to load messages for thread {thread_id}")));
            }
        };

        let messages: Vec<Message> = fetched
            .into_iter()
            .filter_map(|payload| {
                Message::from_payload(payload, &thread_id)
                    .inspect_err(|err| warn!(thread_id = %thread_id, "messages: skipping entry: {err}"))
                    .ok()
            })
            .collect();

        let (entries, unread, directory_changed) = {
            let mut guard = self.inner.lock().await;
            guard.store.merge_fetched(&thread_id, messages);
            let unread = guard.store.unread_from_counterpart(&thread_id, self.self_id);
            let still_open = guard.open_thread.as_ref() == Some(&thread_id);
            let directory_changed = still_open && guard.directory.clear_unread(&thread_id);
            (guard.store.get(&thread_id).to_vec(), unread, directory_changed)
        };

        self.emit(EngineEvent::MessagesUpdated {
            thread_id: thread_id.clone(),
        });
        if directory_changed {
            self.emit(EngineEvent::ThreadsUpdated(self.threads().await));
        }
        if !unread.is_empty() {
            self.mark_read_inner(&thread_id, &unread, false).await;
        }
        self.emit(EngineEvent::ScrollToLatest { thread_id });
        Ok(entries)
    }

    pub async fn close_thread(&self) {
        self.inner.lock().await.open_thread = None;
        self.live.leave().await;
    }

    /// Marks messages read locally and tells the backend, one request per
    /// message. Backend failures are only logged.
    pub async fn mark_read(&self, thread_id: &ThreadId, ids: &[MessageId]) {
        self.mark_read_inner(thread_id, ids, true).await;
    }

    async fn mark_read_inner(&self, thread_id: &ThreadId, ids: &[MessageId], adjust_unread: bool) {
        let (changed, snapshot) = {
            let mut guard = self.inner.lock().await;
            let changed = guard.store.mark_read(thread_id, ids);
            let from_counterpart = changed
                .iter()
                .filter(|message| message.sender_id != self.self_id)
                .count() as u32;
            let snapshot = if adjust_unread && from_counterpart > 0 {
                guard.directory.apply_read(thread_id, from_counterpart);
                Some(guard.directory.threads().to_vec())
            } else {
                None
            };
            (changed, snapshot)
        };

        if changed.is_empty() {
            return;
        }
        self.emit(EngineEvent::MessagesUpdated {
            thread_id: thread_id.clone(),
        });
        if let Some(snapshot) = snapshot {
            self.emit(EngineEvent::ThreadsUpdated(snapshot));
        }

        for message in changed {
            let api = Arc::clone(&self.api);
            tokio::spawn(async move {
                if let Err(err) = api.mark_read(message.id).await {
                    warn!(message_id = message.id.0, "messages: mark-read failed: {err:#}");
                }
            });
        }
    }

    /// Optimistically shows the draft, posts it, and either confirms or
    /// rolls back. A push echo of the same message may land at any point and
    /// still leaves exactly one entry.
    pub async fn send_message(self: &Arc<Self>, draft: Draft) -> Result<Message, SendError> {
        if draft.is_empty() {
            return Err(SendError::Empty);
        }
        let thread_id = draft.thread_id.clone();

        let temp_id = {
            let mut guard = self.inner.lock().await;
            guard.store.append_optimistic(&draft, self.self_id, Utc::now())
        };
        debug!(thread_id = %thread_id, temp_id = temp_id.as_str(), "send: placeholder added");
        self.emit(EngineEvent::MessagesUpdated {
            thread_id: thread_id.clone(),
        });
        self.emit(EngineEvent::ScrollToLatest {
            thread_id: thread_id.clone(),
        });

        let result = self
            .api
            .create_message(draft.to_request())
            .await
            .and_then(|payload| {
                Message::from_payload(payload, &thread_id).context("server returned an unusable message")
            });

        match result {
            Ok(message) => {
                let snapshot = {
                    let mut guard = self.inner.lock().await;
                    guard.store.confirm(&thread_id, &temp_id, message.clone());
                    match guard.directory.upsert_from_message(&message, true, true) {
                        UpsertOutcome::Updated { .. } => Some(guard.directory.threads().to_vec()),
                        UpsertOutcome::UnknownThread => {
                            self.schedule_thread_refresh(&mut guard);
                            None
                        }
                    }
                };
                info!(thread_id = %thread_id, message_id = message.id.0, "send: confirmed");
                self.emit(EngineEvent::MessagesUpdated {
                    thread_id: thread_id.clone(),
                });
                if let Some(snapshot) = snapshot {
                    self.emit(EngineEvent::ThreadsUpdated(snapshot));
                }
                Ok(message)
            }
            Err(err) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.store.rollback(&thread_id, &temp_id);
                }
                let reason = err.to_string();
                let failure = SendError::Rejected {
                    draft: draft.clone(),
                    source: err,
                };
                error!(
                    thread_id = %thread_id,
                    retryable = failure.is_retryable(),
                    "send: failed, rolled back: {reason}"
                );
                self.emit(EngineEvent::MessagesUpdated {
                    thread_id: thread_id.clone(),
                });
                self.emit(EngineEvent::SendFailed {
                    draft,
                    reason: reason.clone(),
                });
                self.emit(EngineEvent::Error(format!("Failed to send message: {reason}")));
                Err(failure)
            }
        }
    }

    /// Folds a pushed message into the store and directory.
    pub async fn handle_remote(self: &Arc<Self>, thread_id: ThreadId, payload: MessagePayload) {
        let message = match Message::from_payload(payload, &thread_id) {
            Ok(message) => message,
            Err(err) => {
                debug!(thread_id = %thread_id, "push: dropping message: {err}");
                return;
            }
        };
        let thread_id = message.thread_id.clone();
        let is_from_self = message.sender_id == self.self_id;

        let (outcome, is_open, snapshot) = {
            let mut guard = self.inner.lock().await;
            let is_open = guard.open_thread.as_ref() == Some(&thread_id);
            let outcome = guard
                .store
                .receive_remote(&thread_id, message.clone(), self.self_id);
            if !outcome.changed() {
                (outcome, is_open, None)
            } else {
                match guard
                    .directory
                    .upsert_from_message(&message, is_from_self, is_open)
                {
                    UpsertOutcome::Updated { .. } => {
                        (outcome, is_open, Some(guard.directory.threads().to_vec()))
                    }
                    UpsertOutcome::UnknownThread => {
                        info!(thread_id = %thread_id, "push: unknown thread, refreshing directory");
                        self.schedule_thread_refresh(&mut guard);
                        (outcome, is_open, None)
                    }
                }
            }
        };

        if outcome == ReceiveOutcome::Ignored {
            debug!(thread_id = %thread_id, message_id = message.id.0, "push: already known");
            return;
        }
        debug!(thread_id = %thread_id, message_id = message.id.0, ?outcome, "push: applied");

        self.emit(EngineEvent::MessagesUpdated {
            thread_id: thread_id.clone(),
        });
        if let Some(snapshot) = snapshot {
            self.emit(EngineEvent::ThreadsUpdated(snapshot));
        }
        if is_open {
            self.emit(EngineEvent::ScrollToLatest {
                thread_id: thread_id.clone(),
            });
            if !is_from_self && !message.is_read {
                self.mark_read_inner(&thread_id, &[message.id], false).await;
            }
        }
    }

    /// Starts the background directory poll. It runs regardless of how the
    /// push channel is doing.
    pub async fn start_polling(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut period = self.config.poll_interval;
        if period.is_zero() {
            period = SyncConfig::default().poll_interval;
            warn!(?period, "poll: zero interval configured, using default");
        }
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let _ = engine.load_threads(true).await;
            }
        });

        if let Some(previous) = self.poller.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub async fn stop_polling(&self) {
        if let Some(task) = self.poller.lock().await.take() {
            task.abort();
        }
    }

    /// Bytes of an attachment: local memory for unsent ones, the backend for
    /// stored ones.
    pub async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        match &attachment.source {
            AttachmentSource::Ephemeral { blob } => self
                .inner
                .lock()
                .await
                .store
                .blob(blob)
                .map(<[u8]>::to_vec)
                .with_context(|| format!("local blob {} is no longer available", blob.as_str())),
            AttachmentSource::Durable { path } => self
                .api
                .download_file(path)
                .await
                .with_context(|| format!("failed to download {}", attachment.file_name)),
        }
    }

    pub async fn shutdown(&self) {
        self.stop_polling().await;
        self.live.leave().await;
        info!("engine: shut down");
    }
}

/// Hands live events to the engine without keeping it alive.
struct EngineSink(Weak<ConversationEngine>);

#[async_trait]
impl InboundMessageSink for EngineSink {
    async fn on_message_sent(&self, thread_id: ThreadId, message: MessagePayload) {
        if let Some(engine) = self.0.upgrade() {
            engine.handle_remote(thread_id, message).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
