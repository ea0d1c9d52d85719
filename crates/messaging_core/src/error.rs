use shared::error::ApiError;
use thiserror::Error;

use crate::types::Draft;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("nothing to send: body is blank and no files are attached")]
    Empty,
    #[error("failed to send message: {source}")]
    Rejected {
        draft: Draft,
        source: anyhow::Error,
    },
}

impl SendError {
    /// The draft to put back into the compose box, if the send got far
    /// enough to take it.
    pub fn into_draft(self) -> Option<Draft> {
        match self {
            SendError::Empty => None,
            SendError::Rejected { draft, .. } => Some(draft),
        }
    }

    /// Whether sending the same draft again may succeed. Requests that never
    /// got an answer count as retryable; backend rejections only when the
    /// backend was overloaded or failing.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Empty => false,
            SendError::Rejected { source, .. } => source
                .downcast_ref::<ApiError>()
                .map_or(true, ApiError::is_transient),
        }
    }
}

#[derive(Debug, Error)]
pub enum PushPayloadError {
    #[error("message payload has no id")]
    MissingId,
    #[error("malformed message payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
