use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::ThreadId,
    protocol::{MessagePayload, PushEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::error::PushPayloadError;

pub const MESSAGE_SENT_EVENT: &str = "MessageSent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Unavailable,
    Disconnected,
}

/// Pub/sub connection the subscriber rides on.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    fn connection_state(&self) -> ConnectionState;
    /// Refreshes the private-channel authorization ahead of a subscribe.
    async fn authorize(&self, channel: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<PushEvent>>;
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

/// Receiver of parsed "message sent" events.
#[async_trait]
pub trait InboundMessageSink: Send + Sync {
    async fn on_message_sent(&self, thread_id: ThreadId, message: MessagePayload);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    AwaitingConnection(ThreadId),
    Subscribed(ThreadId),
    Leaving(ThreadId),
}

impl SubscriptionState {
    pub fn thread(&self) -> Option<&ThreadId> {
        match self {
            SubscriptionState::Idle => None,
            SubscriptionState::AwaitingConnection(thread)
            | SubscriptionState::Subscribed(thread)
            | SubscriptionState::Leaving(thread) => Some(thread),
        }
    }
}

struct SubscriptionSlot {
    state: SubscriptionState,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Keeps at most one push-channel subscription alive, for the open thread.
pub struct LiveSubscriber {
    transport: Arc<dyn LiveTransport>,
    retry_interval: Duration,
    max_attempts: u32,
    slot: Arc<Mutex<SubscriptionSlot>>,
}

impl LiveSubscriber {
    pub fn new(transport: Arc<dyn LiveTransport>, retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            transport,
            retry_interval,
            max_attempts,
            slot: Arc::new(Mutex::new(SubscriptionSlot {
                state: SubscriptionState::Idle,
                generation: 0,
                task: None,
            })),
        }
    }

    pub async fn state(&self) -> SubscriptionState {
        self.slot.lock().await.state.clone()
    }

    /// Leaves the current channel (if any) and starts subscribing to
    /// `thread_id`'s channel in the background.
    pub async fn select(&self, thread_id: ThreadId, sink: Arc<dyn InboundMessageSink>) {
        {
            let guard = self.slot.lock().await;
            if matches!(
                &guard.state,
                SubscriptionState::AwaitingConnection(current) | SubscriptionState::Subscribed(current)
                    if current == &thread_id
            ) {
                debug!(thread_id = %thread_id, "live: thread already selected");
                return;
            }
        }

        let generation = self.leave_current().await;
        if !set_state_if_current(
            &self.slot,
            generation,
            SubscriptionState::AwaitingConnection(thread_id.clone()),
        )
        .await
        {
            return;
        }

        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.transport),
            Arc::clone(&self.slot),
            generation,
            thread_id,
            sink,
            self.retry_interval,
            self.max_attempts,
        ));

        let mut guard = self.slot.lock().await;
        if guard.generation == generation {
            guard.task = Some(task);
        } else {
            task.abort();
        }
    }

    pub async fn leave(&self) {
        self.leave_current().await;
    }

    /// Tears down the current subscription and returns the new generation.
    async fn leave_current(&self) -> u64 {
        let (generation, task, previous) = {
            let mut guard = self.slot.lock().await;
            guard.generation += 1;
            let previous = guard.state.thread().cloned();
            if let Some(thread) = &previous {
                guard.state = SubscriptionState::Leaving(thread.clone());
            }
            (guard.generation, guard.task.take(), previous)
        };

        if let Some(task) = task {
            task.abort();
        }

        if let Some(thread) = previous {
            let channel = thread.channel_name();
            match self.transport.unsubscribe(&channel).await {
                Ok(()) => info!(channel = %channel, "live: left channel"),
                Err(err) => warn!(channel = %channel, "live: unsubscribe failed: {err:#}"),
            }
        }

        let mut guard = self.slot.lock().await;
        if guard.generation == generation {
            guard.state = SubscriptionState::Idle;
        }
        generation
    }
}

/// Polls the transport until it reports connected. Returns false when the
/// attempts run out.
pub async fn wait_for_connection(
    transport: &dyn LiveTransport,
    retry_interval: Duration,
    max_attempts: u32,
) -> bool {
    for attempt in 1..=max_attempts {
        if transport.connection_state() == ConnectionState::Connected {
            return true;
        }
        debug!(attempt, max_attempts, "live: waiting for connection");
        tokio::time::sleep(retry_interval).await;
    }
    transport.connection_state() == ConnectionState::Connected
}

async fn set_state_if_current(
    slot: &Mutex<SubscriptionSlot>,
    generation: u64,
    state: SubscriptionState,
) -> bool {
    let mut guard = slot.lock().await;
    if guard.generation != generation {
        return false;
    }
    guard.state = state;
    true
}

async fn run_subscription(
    transport: Arc<dyn LiveTransport>,
    slot: Arc<Mutex<SubscriptionSlot>>,
    generation: u64,
    thread_id: ThreadId,
    sink: Arc<dyn InboundMessageSink>,
    retry_interval: Duration,
    max_attempts: u32,
) {
    let channel = thread_id.channel_name();

    if transport.connection_state() != ConnectionState::Connected {
        if !wait_for_connection(transport.as_ref(), retry_interval, max_attempts).await {
            warn!(
                channel = %channel,
                attempts = max_attempts,
                "live: transport still not connected, subscribing anyway"
            );
        }
    }

    if slot.lock().await.generation != generation {
        return;
    }

    if let Err(err) = transport.authorize(&channel).await {
        warn!(channel = %channel, "live: channel authorization failed: {err:#}");
    }

    let mut events = match transport.subscribe(&channel).await {
        Ok(events) => events,
        Err(err) => {
            error!(channel = %channel, "live: subscribe failed: {err:#}");
            set_state_if_current(&slot, generation, SubscriptionState::Idle).await;
            return;
        }
    };

    if !set_state_if_current(&slot, generation, SubscriptionState::Subscribed(thread_id.clone())).await {
        let _ = transport.unsubscribe(&channel).await;
        return;
    }
    info!(channel = %channel, "live: subscribed");

    loop {
        match events.recv().await {
            Ok(event) => dispatch_event(&event, &thread_id, sink.as_ref()).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(channel = %channel, skipped, "live: event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!(channel = %channel, "live: event stream closed");
    set_state_if_current(&slot, generation, SubscriptionState::Idle).await;
}

async fn dispatch_event(event: &PushEvent, subscribed: &ThreadId, sink: &dyn InboundMessageSink) {
    match parse_message_sent(event) {
        Ok(Some(message)) => {
            let thread_id = message
                .thread_id
                .clone()
                .unwrap_or_else(|| subscribed.clone());
            sink.on_message_sent(thread_id, message).await;
        }
        Ok(None) => debug!(event = %event.event, "live: ignoring unrelated event"),
        Err(err) => warn!(channel = %event.channel, "live: dropping push event: {err}"),
    }
}

/// Matches `MessageSent`, `.MessageSent` and namespaced forms such as
/// `App\Events\MessageSent`.
pub fn is_message_sent_event(name: &str) -> bool {
    name.rsplit(|c| c == '\\' || c == '.').next() == Some(MESSAGE_SENT_EVENT)
}

/// Pulls the message out of a "message sent" push event. Returns `Ok(None)`
/// for other events.
pub fn parse_message_sent(event: &PushEvent) -> Result<Option<MessagePayload>, PushPayloadError> {
    if !is_message_sent_event(&event.event) {
        return Ok(None);
    }

    let data = match &event.data {
        Value::String(raw) => serde_json::from_str::<Value>(raw)?,
        other => other.clone(),
    };
    let message = match data {
        Value::Object(mut map) => match map.remove("message") {
            Some(inner @ Value::Object(_)) => inner,
            Some(other) => {
                map.insert("message".into(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    };

    if message.get("id").map_or(true, Value::is_null) {
        return Err(PushPayloadError::MissingId);
    }
    Ok(Some(serde_json::from_value(message)?))
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
