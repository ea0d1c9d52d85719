//! Conversation sync for the tutoring-center messaging client: thread
//! directory, per-thread message store, live push subscription and the
//! reconciliation rules tying optimistic sends, REST responses, push events
//! and polling together.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod message_store;
pub mod thread_directory;
pub mod transport;
pub mod types;

pub use api::{HttpMessagingApi, MessagingApi};
pub use config::{load_settings, ClientSettings, SyncConfig};
pub use engine::{ConversationEngine, EngineEvent};
pub use error::{PushPayloadError, SendError};
pub use live::{ConnectionState, LiveSubscriber, LiveTransport, SubscriptionState};
pub use message_store::{MessageStore, ReceiveOutcome};
pub use thread_directory::{ThreadDirectory, UpsertOutcome};
pub use transport::WsLiveTransport;
pub use types::{
    Attachment, AttachmentSource, DeliveryState, Draft, DraftFile, Message, MessageEntry,
    PendingMessage, TempId, Thread,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
