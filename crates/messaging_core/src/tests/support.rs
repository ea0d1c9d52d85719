use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, ThreadId, UserId},
    error::ApiError,
    protocol::{
        CreateMessageRequest, LastMessagePayload, MessagePayload, PageParams, ParticipantPayload,
        PushEvent, ThreadSummary,
    },
};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::{
    api::MessagingApi,
    config::SyncConfig,
    live::{ConnectionState, LiveTransport},
    types::{LastMessage, Message, Participant, Thread},
};

pub const SELF_ID: UserId = UserId(1);
pub const COUNTERPART: UserId = UserId(2);

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub fn message(id: i64, thread: &str, sender: UserId, body: &str, minute: u32) -> Message {
    let recipient = if sender == SELF_ID { COUNTERPART } else { SELF_ID };
    Message {
        id: MessageId(id),
        thread_id: ThreadId::new(thread),
        sender_id: sender,
        recipient_id: recipient,
        subject: None,
        body: body.to_string(),
        is_read: false,
        created_at: at(minute),
        attachments: Vec::new(),
    }
}

pub fn payload(message: &Message) -> MessagePayload {
    MessagePayload {
        id: Some(message.id),
        thread_id: Some(message.thread_id.clone()),
        sender_id: message.sender_id,
        recipient_id: message.recipient_id,
        subject: message.subject.clone(),
        body: message.body.clone(),
        is_read: message.is_read,
        created_at: message.created_at,
        attachments: Vec::new(),
        sender: None,
    }
}

pub fn thread(id: &str, participant: UserId, last: Option<(i64, &str, u32)>, unread: u32) -> Thread {
    Thread {
        thread_id: ThreadId::new(id),
        participant: Participant {
            id: participant,
            name: format!("user-{}", participant.0),
            avatar: None,
            role: None,
        },
        last_message: last.map(|(id, body, minute)| LastMessage {
            id: MessageId(id),
            body: body.to_string(),
            subject: None,
            sender_id: participant,
            is_read: false,
            created_at: at(minute),
        }),
        unread_count: unread,
    }
}

pub fn summary(thread: &Thread) -> ThreadSummary {
    ThreadSummary {
        thread_id: thread.thread_id.clone(),
        participant: ParticipantPayload {
            id: thread.participant.id,
            name: thread.participant.name.clone(),
            avatar: None,
            role: None,
        },
        last_message: thread.last_message.as_ref().map(|last| LastMessagePayload {
            id: last.id,
            body: last.body.clone(),
            subject: last.subject.clone(),
            sender_id: last.sender_id,
            is_read: last.is_read,
            created_at: last.created_at,
        }),
        unread_count: thread.unread_count,
    }
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        thread_refresh_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(50),
        connect_retry_interval: Duration::from_millis(10),
        connect_max_attempts: 3,
        ..SyncConfig::default()
    }
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[derive(Default)]
pub struct FakeApi {
    pub threads: Mutex<Vec<ThreadSummary>>,
    pub messages: Mutex<HashMap<ThreadId, Vec<MessagePayload>>>,
    pub created: Mutex<Vec<CreateMessageRequest>>,
    /// `None` makes `create_message` fail like an offline request.
    pub create_response: Mutex<Option<MessagePayload>>,
    /// Returned by `create_message` instead of a response when set.
    pub create_error: Mutex<Option<ApiError>>,
    /// When set, `create_message` waits for this before answering.
    pub create_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub mark_read_calls: Mutex<Vec<MessageId>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub list_threads_calls: AtomicUsize,
    pub fail_threads: AtomicBool,
    pub fail_mark_read: AtomicBool,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_threads(&self, threads: &[Thread]) {
        *self.threads.lock().await = threads.iter().map(summary).collect();
    }

    pub fn list_threads_calls(&self) -> usize {
        self.list_threads_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.list_threads_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_threads.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        Ok(self.threads.lock().await.clone())
    }

    async fn list_messages(
        &self,
        thread_id: &ThreadId,
        _page: PageParams,
    ) -> Result<Vec<MessagePayload>> {
        Ok(self
            .messages
            .lock()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<MessagePayload> {
        self.created.lock().await.push(request);
        let gate = self.create_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = self.create_error.lock().await.clone() {
            return Err(err.into());
        }
        self.create_response
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("network unreachable"))
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.mark_read_calls.lock().await.push(message_id);
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(anyhow!("mark-read rejected"));
        }
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {path}"))
    }
}

pub struct FakeTransport {
    state: std::sync::Mutex<ConnectionState>,
    calls: Mutex<Vec<String>>,
    senders: Mutex<HashMap<String, broadcast::Sender<PushEvent>>>,
    pub fail_subscribe: AtomicBool,
}

impl FakeTransport {
    pub fn with_state(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            fail_subscribe: AtomicBool::new(false),
        })
    }

    pub fn connected() -> Arc<Self> {
        Self::with_state(ConnectionState::Connected)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.senders.lock().await.contains_key(channel)
    }

    /// Delivers an event to subscribers of `channel`. Returns false when
    /// nobody is listening.
    pub async fn publish(&self, channel: &str, event: &str, data: serde_json::Value) -> bool {
        let sender = self.senders.lock().await.get(channel).cloned();
        match sender {
            Some(sender) => sender
                .send(PushEvent {
                    channel: channel.to_string(),
                    event: event.to_string(),
                    data,
                })
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    async fn authorize(&self, channel: &str) -> Result<()> {
        self.calls.lock().await.push(format!("authorize:{channel}"));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<PushEvent>> {
        self.calls.lock().await.push(format!("subscribe:{channel}"));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("subscription rejected"));
        }
        let mut senders = self.senders.lock().await;
        let sender = senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(sender.subscribe())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.calls.lock().await.push(format!("unsubscribe:{channel}"));
        self.senders.lock().await.remove(channel);
        Ok(())
    }
}
