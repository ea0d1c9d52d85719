use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::protocol::{ChannelAuthRequest, ChannelAuthResponse, PushEvent};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::live::{ConnectionState, LiveTransport};

const PRIVATE_PREFIX: &str = "private-";
const CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct PusherFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablished {
    socket_id: String,
}

#[derive(Default)]
struct TransportShared {
    socket_id: Option<String>,
    channels: HashMap<String, broadcast::Sender<PushEvent>>,
    auths: HashMap<String, String>,
}

/// Pusher-protocol WebSocket client with private-channel authorization.
pub struct WsLiveTransport {
    http: Client,
    auth_endpoint: String,
    access_token: Option<String>,
    state: Arc<AtomicU8>,
    shared: Arc<Mutex<TransportShared>>,
    outbound: mpsc::UnboundedSender<String>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl WsLiveTransport {
    pub async fn connect(
        ws_url: &str,
        auth_endpoint: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Arc<Self>> {
        let state = Arc::new(AtomicU8::new(encode_state(ConnectionState::Connecting)));
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Mutex::new(TransportShared::default()));

        let writer_state = Arc::clone(&state);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(frame)).await {
                    error!("live transport: websocket send failed: {err}");
                    writer_state.store(encode_state(ConnectionState::Disconnected), Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_state = Arc::clone(&state);
        let reader_shared = Arc::clone(&shared);
        let pong_tx = outbound.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        handle_frame(&text, &reader_state, &reader_shared, &pong_tx).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("live transport: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            reader_state.store(encode_state(ConnectionState::Disconnected), Ordering::SeqCst);
            // Dropping the senders closes every subscriber's stream.
            reader_shared.lock().await.channels.clear();
        });

        info!(url = %ws_url, "live transport: websocket opened");
        Ok(Arc::new(Self {
            http: Client::new(),
            auth_endpoint: auth_endpoint.into(),
            access_token,
            state,
            shared,
            outbound,
            reader_task,
            writer_task,
        }))
    }

    fn send_frame(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(frame.to_string())
            .map_err(|_| anyhow!("websocket writer is closed"))
    }
}

impl Drop for WsLiveTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[async_trait]
impl LiveTransport for WsLiveTransport {
    fn connection_state(&self) -> ConnectionState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    async fn authorize(&self, channel: &str) -> Result<()> {
        let socket_id = self
            .shared
            .lock()
            .await
            .socket_id
            .clone()
            .ok_or_else(|| anyhow!("socket id not yet assigned"))?;
        let channel_name = wire_channel(channel);

        let mut request = self
            .http
            .post(&self.auth_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&ChannelAuthRequest {
                socket_id,
                channel_name: channel_name.clone(),
            });
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response: ChannelAuthResponse = request
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("channel authorization rejected for {channel_name}"))?
            .json()
            .await?;

        self.shared
            .lock()
            .await
            .auths
            .insert(channel.to_string(), response.auth);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<PushEvent>> {
        let (receiver, auth) = {
            let mut guard = self.shared.lock().await;
            let receiver = guard
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
                .subscribe();
            (receiver, guard.auths.get(channel).cloned())
        };

        let mut data = json!({ "channel": wire_channel(channel) });
        if let Some(auth) = auth {
            data["auth"] = Value::String(auth);
        }
        self.send_frame(json!({ "event": "pusher:subscribe", "data": data }))?;
        debug!(channel, "live transport: subscribe sent");
        Ok(receiver)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        {
            let mut guard = self.shared.lock().await;
            guard.channels.remove(channel);
            guard.auths.remove(channel);
        }
        self.send_frame(json!({
            "event": "pusher:unsubscribe",
            "data": { "channel": wire_channel(channel) },
        }))
    }
}

async fn handle_frame(
    text: &str,
    state: &AtomicU8,
    shared: &Mutex<TransportShared>,
    outbound: &mpsc::UnboundedSender<String>,
) {
    let frame = match serde_json::from_str::<PusherFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("live transport: unreadable frame: {err}");
            return;
        }
    };
    let data = decode_data(frame.data);

    match frame.event.as_str() {
        "pusher:connection_established" => {
            match serde_json::from_value::<ConnectionEstablished>(data) {
                Ok(established) => {
                    info!(socket_id = %established.socket_id, "live transport: connected");
                    shared.lock().await.socket_id = Some(established.socket_id);
                    state.store(encode_state(ConnectionState::Connected), Ordering::SeqCst);
                }
                Err(err) => warn!("live transport: bad connection_established payload: {err}"),
            }
        }
        "pusher:ping" => {
            let _ = outbound.send(json!({ "event": "pusher:pong", "data": {} }).to_string());
        }
        "pusher:error" => {
            warn!(payload = %data, "live transport: server reported error");
            state.store(encode_state(ConnectionState::Unavailable), Ordering::SeqCst);
        }
        "pusher_internal:subscription_succeeded" => {
            debug!(channel = ?frame.channel, "live transport: subscription confirmed");
        }
        _ => {
            let Some(channel) = frame.channel else {
                debug!(event = %frame.event, "live transport: event without channel");
                return;
            };
            let channel = channel
                .strip_prefix(PRIVATE_PREFIX)
                .unwrap_or(&channel)
                .to_string();
            let sender = shared.lock().await.channels.get(&channel).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(PushEvent {
                    channel,
                    event: frame.event,
                    data,
                });
            }
        }
    }
}

/// Pusher double-encodes `data` as a JSON string; decode it when possible.
fn decode_data(data: Value) -> Value {
    match data {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

fn wire_channel(channel: &str) -> String {
    format!("{PRIVATE_PREFIX}{channel}")
}

fn encode_state(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Initialized => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Unavailable => 3,
        ConnectionState::Disconnected => 4,
    }
}

fn decode_state(raw: u8) -> ConnectionState {
    match raw {
        0 => ConnectionState::Initialized,
        1 => ConnectionState::Connecting,
        2 => ConnectionState::Connected,
        3 => ConnectionState::Unavailable,
        _ => ConnectionState::Disconnected,
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
