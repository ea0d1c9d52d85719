use chrono::{DateTime, Utc};
use shared::{
    domain::{AttachmentId, MessageId, Role, ThreadId, UserId},
    protocol::{
        AttachmentPayload, CreateMessageRequest, LastMessagePayload, MessagePayload,
        ParticipantPayload, ThreadSummary, UploadAttachment,
    },
};
use uuid::Uuid;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::PushPayloadError;

const TEMP_ID_PREFIX: &str = "temp-";
const BLOB_REF_PREFIX: &str = "blob:local/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub role: Option<Role>,
}

impl From<ParticipantPayload> for Participant {
    fn from(value: ParticipantPayload) -> Self {
        Self {
            id: value.id,
            name: value.name,
            avatar: value.avatar,
            role: value.role,
        }
    }
}

/// Denormalized copy of a thread's latest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub id: MessageId,
    pub body: String,
    pub subject: Option<String>,
    pub sender_id: UserId,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<LastMessagePayload> for LastMessage {
    fn from(value: LastMessagePayload) -> Self {
        Self {
            id: value.id,
            body: value.body,
            subject: value.subject,
            sender_id: value.sender_id,
            is_read: value.is_read,
            created_at: value.created_at,
        }
    }
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            body: message.body.clone(),
            subject: message.subject.clone(),
            sender_id: message.sender_id,
            is_read: message.is_read,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub thread_id: ThreadId,
    pub participant: Participant,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
}

impl Thread {
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|last| last.created_at)
    }
}

impl From<ThreadSummary> for Thread {
    fn from(value: ThreadSummary) -> Self {
        Self {
            thread_id: value.thread_id,
            participant: value.participant.into(),
            last_message: value.last_message.map(LastMessage::from),
            unread_count: value.unread_count,
        }
    }
}

/// Correlation id of an optimistic message while its send is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempId(String);

impl TempId {
    pub fn generate() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Handle to attachment bytes held in local memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn generate() -> Self {
        Self(format!("{BLOB_REF_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    Durable { path: String },
    Ephemeral { blob: BlobRef },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: Option<AttachmentId>,
    pub file_name: String,
    pub source: AttachmentSource,
    pub size: u64,
    pub mime_type: Option<String>,
}

impl Attachment {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.source, AttachmentSource::Ephemeral { .. })
    }
}

impl From<AttachmentPayload> for Attachment {
    fn from(value: AttachmentPayload) -> Self {
        Self {
            id: value.id,
            file_name: value.file_name,
            source: AttachmentSource::Durable {
                path: value.file_path,
            },
            size: value.file_size,
            mime_type: value.mime_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub subject: Option<String>,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Converts a backend payload, using `fallback_thread` when the payload
    /// does not carry its own thread id.
    pub fn from_payload(
        payload: MessagePayload,
        fallback_thread: &ThreadId,
    ) -> Result<Self, PushPayloadError> {
        let id = payload.id.ok_or(PushPayloadError::MissingId)?;
        Ok(Self {
            id,
            thread_id: payload
                .thread_id
                .unwrap_or_else(|| fallback_thread.clone()),
            sender_id: payload.sender_id,
            recipient_id: payload.recipient_id,
            subject: payload.subject,
            body: payload.body,
            is_read: payload.is_read,
            created_at: payload.created_at,
            attachments: payload
                .attachments
                .into_iter()
                .map(Attachment::from)
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub temp_id: TempId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    OptimisticPending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl MessageEntry {
    pub fn delivery_state(&self) -> DeliveryState {
        match self {
            MessageEntry::Pending(_) => DeliveryState::OptimisticPending,
            MessageEntry::Confirmed(_) => DeliveryState::Confirmed,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            MessageEntry::Pending(pending) => pending.created_at,
            MessageEntry::Confirmed(message) => message.created_at,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            MessageEntry::Pending(pending) => &pending.body,
            MessageEntry::Confirmed(message) => &message.body,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            MessageEntry::Pending(pending) => pending.sender_id,
            MessageEntry::Confirmed(message) => message.sender_id,
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        self.confirmed().map(|message| message.id)
    }

    pub fn temp_id(&self) -> Option<&TempId> {
        match self {
            MessageEntry::Pending(pending) => Some(&pending.temp_id),
            MessageEntry::Confirmed(_) => None,
        }
    }

    pub fn confirmed(&self) -> Option<&Message> {
        match self {
            MessageEntry::Confirmed(message) => Some(message),
            MessageEntry::Pending(_) => None,
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        match self {
            MessageEntry::Pending(pending) => &pending.attachments,
            MessageEntry::Confirmed(message) => &message.attachments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftFile {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// What the user composed. Handed back untouched when a send fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub thread_id: ThreadId,
    pub recipient_id: UserId,
    pub subject: Option<String>,
    pub body: String,
    pub files: Vec<DraftFile>,
}

impl Draft {
    pub fn new(thread_id: ThreadId, recipient_id: UserId, body: impl Into<String>) -> Self {
        Self {
            thread_id,
            recipient_id,
            subject: None,
            body: body.into(),
            files: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_file(mut self, file: DraftFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty() && self.files.is_empty()
    }

    pub fn to_request(&self) -> CreateMessageRequest {
        CreateMessageRequest {
            recipient_id: self.recipient_id,
            subject: self.subject.clone(),
            body: self.body.clone(),
            thread_id: Some(self.thread_id.clone()),
            attachments: self
                .files
                .iter()
                .map(|file| UploadAttachment {
                    file_name: file.file_name.clone(),
                    mime_type: file.mime_type.clone(),
                    content_b64: STANDARD.encode(&file.bytes),
                })
                .collect(),
        }
    }
}
