use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, ThreadId, UserId};
use tracing::debug;

use crate::types::{
    Attachment, AttachmentSource, BlobRef, Draft, Message, MessageEntry, PendingMessage, TempId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Appended as a new confirmed message.
    Inserted,
    /// Replaced the optimistic placeholder with this temp id.
    Superseded(TempId),
    /// An entry with the same id existed and was refreshed.
    Updated,
    /// Already known; nothing changed.
    Ignored,
}

impl ReceiveOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, ReceiveOutcome::Ignored)
    }
}

/// Per-thread message lists, each kept ascending by `created_at`.
#[derive(Debug, Default)]
pub struct MessageStore {
    threads: HashMap<ThreadId, Vec<MessageEntry>>,
    blobs: HashMap<BlobRef, Vec<u8>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: &ThreadId) -> &[MessageEntry] {
        self.threads
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn blob(&self, blob: &BlobRef) -> Option<&[u8]> {
        self.blobs.get(blob).map(Vec::as_slice)
    }

    pub fn append_optimistic(
        &mut self,
        draft: &Draft,
        sender_id: UserId,
        now: DateTime<Utc>,
    ) -> TempId {
        let temp_id = TempId::generate();
        let attachments = draft
            .files
            .iter()
            .map(|file| {
                let blob = BlobRef::generate();
                self.blobs.insert(blob.clone(), file.bytes.clone());
                Attachment {
                    id: None,
                    file_name: file.file_name.clone(),
                    source: AttachmentSource::Ephemeral { blob },
                    size: file.bytes.len() as u64,
                    mime_type: file.mime_type.clone(),
                }
            })
            .collect();

        let entries = self.threads.entry(draft.thread_id.clone()).or_default();
        entries.push(MessageEntry::Pending(PendingMessage {
            temp_id: temp_id.clone(),
            thread_id: draft.thread_id.clone(),
            sender_id,
            recipient_id: draft.recipient_id,
            subject: draft.subject.clone(),
            body: draft.body.clone(),
            created_at: now,
            attachments,
        }));
        sort_entries(entries);
        temp_id
    }

    /// Swaps the placeholder for the server's copy. Returns whether the list
    /// changed.
    pub fn confirm(&mut self, thread_id: &ThreadId, temp_id: &TempId, message: Message) -> bool {
        let entries = self.threads.entry(thread_id.clone()).or_default();
        let pending_pos = position_of_temp(entries, temp_id);
        let existing_pos = position_of_id(entries, message.id);

        let released = match (pending_pos, existing_pos) {
            (Some(pos), None) => {
                let previous = std::mem::replace(&mut entries[pos], MessageEntry::Confirmed(message));
                Some(previous)
            }
            (Some(pos), Some(_)) => Some(entries.remove(pos)),
            (None, Some(_)) => return false,
            (None, None) => {
                // A self echo consumed a different placeholder first.
                entries.push(MessageEntry::Confirmed(message));
                None
            }
        };
        sort_entries(entries);

        if let Some(MessageEntry::Pending(pending)) = released {
            self.release_blobs(&pending);
        }
        true
    }

    pub fn rollback(&mut self, thread_id: &ThreadId, temp_id: &TempId) -> Option<PendingMessage> {
        let entries = self.threads.get_mut(thread_id)?;
        let pos = position_of_temp(entries, temp_id)?;
        let MessageEntry::Pending(pending) = entries.remove(pos) else {
            return None;
        };
        self.release_blobs(&pending);
        Some(pending)
    }

    pub fn receive_remote(
        &mut self,
        thread_id: &ThreadId,
        message: Message,
        self_id: UserId,
    ) -> ReceiveOutcome {
        let is_from_self = message.sender_id == self_id;
        let entries = self.threads.entry(thread_id.clone()).or_default();

        if let Some(pos) = position_of_id(entries, message.id) {
            if !is_from_self {
                debug!(thread_id = %thread_id, message_id = message.id.0, "duplicate message ignored");
                return ReceiveOutcome::Ignored;
            }
            let MessageEntry::Confirmed(existing) = &entries[pos] else {
                return ReceiveOutcome::Ignored;
            };
            let merged = merge_confirmed(existing, message);
            if &merged == existing {
                return ReceiveOutcome::Ignored;
            }
            entries[pos] = MessageEntry::Confirmed(merged);
            sort_entries(entries);
            return ReceiveOutcome::Updated;
        }

        if is_from_self {
            if let Some(pos) = placeholder_for(entries, &message) {
                let previous = std::mem::replace(&mut entries[pos], MessageEntry::Confirmed(message));
                sort_entries(entries);
                if let MessageEntry::Pending(pending) = previous {
                    let temp_id = pending.temp_id.clone();
                    self.release_blobs(&pending);
                    return ReceiveOutcome::Superseded(temp_id);
                }
                return ReceiveOutcome::Updated;
            }
        }

        entries.push(MessageEntry::Confirmed(message));
        sort_entries(entries);
        ReceiveOutcome::Inserted
    }

    /// Folds a page fetched from the backend into the thread. Fetched copies
    /// win by id; local entries missing from the page are kept.
    pub fn merge_fetched(&mut self, thread_id: &ThreadId, fetched: Vec<Message>) {
        let entries = self.threads.entry(thread_id.clone()).or_default();
        for message in fetched {
            match position_of_id(entries, message.id) {
                Some(pos) => {
                    if let MessageEntry::Confirmed(existing) = &entries[pos] {
                        let merged = merge_confirmed(existing, message);
                        entries[pos] = MessageEntry::Confirmed(merged);
                    }
                }
                None => entries.push(MessageEntry::Confirmed(message)),
            }
        }
        sort_entries(entries);
    }

    /// Flips `is_read` on the given confirmed messages and returns the ones
    /// that actually changed.
    pub fn mark_read(&mut self, thread_id: &ThreadId, ids: &[MessageId]) -> Vec<Message> {
        let Some(entries) = self.threads.get_mut(thread_id) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for entry in entries.iter_mut() {
            if let MessageEntry::Confirmed(message) = entry {
                if !message.is_read && ids.contains(&message.id) {
                    message.is_read = true;
                    changed.push(message.clone());
                }
            }
        }
        changed
    }

    pub fn unread_from_counterpart(&self, thread_id: &ThreadId, self_id: UserId) -> Vec<MessageId> {
        self.get(thread_id)
            .iter()
            .filter_map(MessageEntry::confirmed)
            .filter(|message| message.sender_id != self_id && !message.is_read)
            .map(|message| message.id)
            .collect()
    }

    pub fn pending_count(&self, thread_id: &ThreadId) -> usize {
        self.get(thread_id)
            .iter()
            .filter(|entry| entry.temp_id().is_some())
            .count()
    }

    fn release_blobs(&mut self, pending: &PendingMessage) {
        for attachment in &pending.attachments {
            if let AttachmentSource::Ephemeral { blob } = &attachment.source {
                self.blobs.remove(blob);
            }
        }
    }
}

fn position_of_id(entries: &[MessageEntry], id: MessageId) -> Option<usize> {
    entries.iter().position(|entry| entry.id() == Some(id))
}

fn position_of_temp(entries: &[MessageEntry], temp_id: &TempId) -> Option<usize> {
    entries
        .iter()
        .position(|entry| entry.temp_id() == Some(temp_id))
}

/// Placeholder a self-sent message confirms: the oldest one with the same
/// subject and body, else the oldest one overall. An echo from another
/// device can take an unrelated placeholder this way; that send still lands
/// through the `(None, None)` arm of `confirm`.
fn placeholder_for(entries: &[MessageEntry], message: &Message) -> Option<usize> {
    let matching = entries.iter().position(|entry| match entry {
        MessageEntry::Pending(pending) => {
            pending.body == message.body && pending.subject == message.subject
        }
        MessageEntry::Confirmed(_) => false,
    });
    matching.or_else(|| entries.iter().position(|entry| entry.temp_id().is_some()))
}

/// `is_read` only ever moves from false to true.
fn merge_confirmed(existing: &Message, incoming: Message) -> Message {
    Message {
        is_read: existing.is_read || incoming.is_read,
        ..incoming
    }
}

fn sort_entries(entries: &mut [MessageEntry]) {
    entries.sort_by(compare_entries);
}

fn compare_entries(a: &MessageEntry, b: &MessageEntry) -> Ordering {
    a.created_at()
        .cmp(&b.created_at())
        .then_with(|| match (a, b) {
            (MessageEntry::Confirmed(x), MessageEntry::Confirmed(y)) => x.id.cmp(&y.id),
            (MessageEntry::Confirmed(_), MessageEntry::Pending(_)) => Ordering::Less,
            (MessageEntry::Pending(_), MessageEntry::Confirmed(_)) => Ordering::Greater,
            (MessageEntry::Pending(_), MessageEntry::Pending(_)) => Ordering::Equal,
        })
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
