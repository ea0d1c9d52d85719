use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{MessageId, ThreadId},
    error::ApiError,
    protocol::{CreateMessageRequest, MessagePayload, PageParams, ThreadSummary},
};
use tracing::debug;
use url::Url;

/// REST collaborator the engine reads threads and messages from.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>>;
    async fn list_messages(
        &self,
        thread_id: &ThreadId,
        page: PageParams,
    ) -> Result<Vec<MessagePayload>>;
    async fn create_message(&self, request: CreateMessageRequest) -> Result<MessagePayload>;
    async fn mark_read(&self, message_id: MessageId) -> Result<()>;
    async fn download_file(&self, path: &str) -> Result<Vec<u8>>;
}

const THREAD_LIST_KEYS: &[&str] = &["threads", "conversations"];
const MESSAGE_LIST_KEYS: &[&str] = &["messages"];
const MESSAGE_KEYS: &[&str] = &["message"];

pub struct HttpMessagingApi {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpMessagingApi {
    pub fn new(base_url: &str, access_token: Option<String>) -> Result<Self> {
        let parsed = Url::parse(base_url).with_context(|| format!("invalid api base url: {base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("api base url must be http(s): {base_url}"));
        }
        Ok(Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        keys: &[&str],
        what: &str,
    ) -> Result<T> {
        let response = self.authorized(request).send().await?;
        let body = read_json(response).await?;
        let unwrapped = unwrap_envelope(body, keys);
        serde_json::from_value(unwrapped).with_context(|| format!("unexpected {what} response shape"))
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let request = self.http.get(format!("{}/messages/threads", self.base_url));
        self.fetch_json(request, THREAD_LIST_KEYS, "thread list").await
    }

    async fn list_messages(
        &self,
        thread_id: &ThreadId,
        page: PageParams,
    ) -> Result<Vec<MessagePayload>> {
        let request = self
            .http
            .get(format!("{}/messages/threads/{}", self.base_url, thread_id))
            .query(&page);
        self.fetch_json(request, MESSAGE_LIST_KEYS, "message list").await
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<MessagePayload> {
        debug!(
            recipient_id = request.recipient_id.0,
            attachments = request.attachments.len(),
            "posting message"
        );
        let request = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&request);
        self.fetch_json(request, MESSAGE_KEYS, "create message").await
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/messages/{}/read", self.base_url, message_id));
        let response = self.authorized(request).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        let request = self
            .http
            .get(format!("{}/files/download", self.base_url))
            .query(&[("path", path)]);
        let response = self.authorized(request).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_body(status.as_u16(), &body).into())
}

async fn read_json(response: Response) -> Result<Value> {
    let response = ensure_success(response).await?;
    let text = response.text().await?;
    serde_json::from_str(&text).context("response body is not json")
}

/// Peels the wrappers the backend puts around payloads:
/// `{"data": ...}`, paginated `{"data": {"data": [...]}}` and named keys such
/// as `{"messages": [...]}`. Only descends into objects and arrays, so a
/// message whose `message` field is its body text is left alone.
pub fn unwrap_envelope(mut value: Value, keys: &[&str]) -> Value {
    loop {
        let Value::Object(map) = &mut value else {
            return value;
        };
        let next = std::iter::once("data")
            .chain(keys.iter().copied())
            .find(|key| matches!(map.get(*key), Some(Value::Object(_) | Value::Array(_))));
        match next.and_then(|key| map.remove(key)) {
            Some(inner) => value = inner,
            None => return value,
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
