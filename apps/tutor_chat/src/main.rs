use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use messaging_core::{
    config::{load_settings_from, DEFAULT_SETTINGS_FILE},
    Attachment, AttachmentSource, ClientSettings, ConnectionState, ConversationEngine, Draft,
    DraftFile, EngineEvent, HttpMessagingApi, LiveTransport, MessageEntry, Thread,
    WsLiveTransport,
};
use shared::{
    domain::{ThreadId, UserId},
    protocol::PushEvent,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tutor_chat", about = "Tutoring-center messaging client")]
struct Cli {
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations, most recent first.
    Threads,
    /// Print a conversation and mark it read.
    Open { thread_id: String },
    Send {
        thread_id: String,
        recipient_id: i64,
        body: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
    /// Follow the directory (and optionally one thread) until Ctrl-C.
    Watch { thread_id: Option<String> },
    Download { path: String, out: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(&cli.config, |key| std::env::var(key).ok());
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = cli.token {
        settings.access_token = Some(token);
    }
    if let Some(user_id) = cli.user_id {
        settings.user_id = Some(UserId(user_id));
    }
    let user_id = settings
        .user_id
        .context("user id is required (--user-id or APP__USER_ID)")?;

    let api = Arc::new(HttpMessagingApi::new(
        &settings.api_base(),
        settings.access_token.clone(),
    )?);
    let transport = connect_transport(&settings).await;
    let engine = ConversationEngine::new(api, transport, user_id, settings.sync.clone());

    match cli.command {
        Command::Threads => {
            for thread in engine.load_threads(false).await? {
                println!("{}", describe_thread(&thread));
            }
        }
        Command::Open { thread_id } => {
            let _ = engine.load_threads(true).await;
            let entries = engine.open_thread(ThreadId::new(thread_id)).await?;
            for entry in &entries {
                println!("{}", describe_entry(entry));
            }
            engine.shutdown().await;
        }
        Command::Send {
            thread_id,
            recipient_id,
            body,
            subject,
            files,
        } => {
            let mut draft = Draft::new(ThreadId::new(thread_id), UserId(recipient_id), body);
            if let Some(subject) = subject {
                draft = draft.with_subject(subject);
            }
            for path in files {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("not a file path: {}", path.display()))?;
                draft = draft.with_file(DraftFile {
                    file_name,
                    mime_type: None,
                    bytes,
                });
            }
            let message = engine.send_message(draft).await?;
            println!("sent message_id={} thread_id={}", message.id, message.thread_id);
        }
        Command::Watch { thread_id } => watch(&engine, thread_id.map(ThreadId::new)).await?,
        Command::Download { path, out } => {
            let attachment = Attachment {
                id: None,
                file_name: path.clone(),
                source: AttachmentSource::Durable { path },
                size: 0,
                mime_type: None,
            };
            let bytes = engine.download_attachment(&attachment).await?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), out.display());
        }
    }

    Ok(())
}

async fn watch(engine: &Arc<ConversationEngine>, thread_id: Option<ThreadId>) -> Result<()> {
    let mut events = engine.subscribe_events();
    for thread in engine.load_threads(false).await? {
        println!("{}", describe_thread(&thread));
    }
    engine.start_polling().await;
    if let Some(thread_id) = thread_id {
        for entry in &engine.open_thread(thread_id).await? {
            println!("{}", describe_entry(entry));
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(engine, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch: dropped engine events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn print_event(engine: &ConversationEngine, event: EngineEvent) {
    match event {
        EngineEvent::ThreadsUpdated(threads) => {
            println!("-- conversations --");
            for thread in &threads {
                println!("{}", describe_thread(thread));
            }
        }
        EngineEvent::MessagesUpdated { thread_id } => {
            if let Some(entry) = engine.messages(&thread_id).await.last() {
                println!("[{thread_id}] {}", describe_entry(entry));
            }
        }
        EngineEvent::ScrollToLatest { .. } => {}
        EngineEvent::SendFailed { draft, reason } => {
            println!("send to {} failed ({reason}); draft kept: {:?}", draft.thread_id, draft.body);
        }
        EngineEvent::Error(message) => eprintln!("error: {message}"),
    }
}

fn describe_thread(thread: &Thread) -> String {
    let preview = thread
        .last_message
        .as_ref()
        .map(|last| last.body.as_str())
        .unwrap_or("");
    format!(
        "{}\t{}\tunread={}\t{}",
        thread.thread_id, thread.participant.name, thread.unread_count, preview
    )
}

fn describe_entry(entry: &MessageEntry) -> String {
    let id = entry
        .id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "pending".into());
    let read = match entry.confirmed() {
        Some(message) if message.is_read => " (read)",
        _ => "",
    };
    let files = entry.attachments().len();
    let attachments = if files > 0 {
        format!(" [{files} file(s)]")
    } else {
        String::new()
    };
    format!(
        "{} #{id} from {}: {}{attachments}{read}",
        entry.created_at().format("%Y-%m-%d %H:%M"),
        entry.sender_id(),
        entry.body()
    )
}

async fn connect_transport(settings: &ClientSettings) -> Arc<dyn LiveTransport> {
    let ws_url = match settings.ws_url() {
        Ok(url) => url,
        Err(err) => {
            warn!("push disabled: {err:#}");
            return Arc::new(OfflineTransport::default());
        }
    };
    match WsLiveTransport::connect(
        &ws_url,
        settings.auth_endpoint(),
        settings.access_token.clone(),
    )
    .await
    {
        Ok(transport) => transport,
        Err(err) => {
            warn!("push unavailable, relying on polling: {err:#}");
            Arc::new(OfflineTransport::default())
        }
    }
}

/// Stand-in when the push socket cannot be opened. Subscriptions stay open
/// but never deliver; the poll keeps the directory fresh.
#[derive(Default)]
struct OfflineTransport {
    channels: Mutex<HashMap<String, broadcast::Sender<PushEvent>>>,
}

#[async_trait]
impl LiveTransport for OfflineTransport {
    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Unavailable
    }

    async fn authorize(&self, channel: &str) -> Result<()> {
        Err(anyhow!("push socket unavailable, cannot authorize {channel}"))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<PushEvent>> {
        info!(channel, "offline: holding subscription without a socket");
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1).0);
        Ok(sender.subscribe())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.channels.lock().await.remove(channel);
        Ok(())
    }
}
