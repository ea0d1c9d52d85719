use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{AttachmentId, MessageId, Role, ThreadId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub id: UserId,
    #[serde(alias = "full_name", alias = "username", default)]
    pub name: String,
    #[serde(alias = "avatar_url", alias = "profile_picture", default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessagePayload {
    pub id: MessageId,
    #[serde(default, alias = "message")]
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub sender_id: UserId,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_read: bool,
    #[serde(deserialize_with = "flexible_timestamp", alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    #[serde(alias = "id")]
    pub thread_id: ThreadId,
    #[serde(alias = "other_user", alias = "user")]
    pub participant: ParticipantPayload,
    #[serde(default, alias = "latest_message")]
    pub last_message: Option<LastMessagePayload>,
    #[serde(default, alias = "unread")]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub id: Option<AttachmentId>,
    #[serde(alias = "filename", alias = "original_name")]
    pub file_name: String,
    #[serde(alias = "path")]
    pub file_path: String,
    #[serde(default, alias = "size", alias = "size_bytes")]
    pub file_size: u64,
    #[serde(default, alias = "mime")]
    pub mime_type: Option<String>,
}

/// A message as the backend serializes it. `id` stays optional so pushed
/// payloads without one can be detected and dropped instead of failing the
/// whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "message")]
    pub body: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_read: bool,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub sender: Option<ParticipantPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAttachment {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub content_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub recipient_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<UploadAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageParams {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 50,
        }
    }
}

/// Event delivered on a push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub channel: String,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthRequest {
    pub socket_id: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub auth: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBool {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Accepts `true`, `1`, `"1"` and `"true"` style encodings.
pub fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawBool>::deserialize(deserializer)?;
    Ok(match raw {
        None => false,
        Some(RawBool::Bool(value)) => value,
        Some(RawBool::Int(value)) => value != 0,
        Some(RawBool::Text(text)) => matches!(text.trim(), "1" | "true" | "TRUE" | "True"),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Number(i64),
    Text(String),
}

/// Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS` (taken as UTC) and unix
/// seconds, either as a number or a numeric string.
pub fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Number(secs) => from_unix_seconds(secs),
        RawTimestamp::Text(text) => parse_timestamp(&text),
    }
    .map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return from_unix_seconds(secs);
    }
    Err(format!("unrecognized timestamp: {raw:?}"))
}

fn from_unix_seconds(secs: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp out of range: {secs}"))
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
