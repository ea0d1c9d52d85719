use std::cmp::Ordering;

use shared::domain::ThreadId;

use crate::types::{LastMessage, Message, Thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated { unread_count: u32 },
    /// The message belongs to a thread the directory has not loaded yet.
    UnknownThread,
}

/// Conversation sidebar: one entry per counterpart, most recently active
/// first.
#[derive(Debug, Default)]
pub struct ThreadDirectory {
    threads: Vec<Thread>,
}

impl ThreadDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn get(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.threads
            .iter()
            .find(|thread| &thread.thread_id == thread_id)
    }

    /// Replaces the list with a freshly fetched one when it differs in a way
    /// the sidebar would show. Returns whether state was replaced.
    pub fn replace_if_changed(&mut self, mut fetched: Vec<Thread>) -> bool {
        sort_threads(&mut fetched);
        if !differs_materially(&self.threads, &fetched) {
            return false;
        }
        self.threads = fetched;
        true
    }

    pub fn upsert_from_message(
        &mut self,
        message: &Message,
        is_from_self: bool,
        is_thread_open: bool,
    ) -> UpsertOutcome {
        let Some(thread) = self
            .threads
            .iter_mut()
            .find(|thread| thread.thread_id == message.thread_id)
        else {
            return UpsertOutcome::UnknownThread;
        };

        let already_seen = thread
            .last_message
            .as_ref()
            .is_some_and(|last| last.id == message.id);
        let is_latest = thread
            .last_message
            .as_ref()
            .map_or(true, |last| message.created_at >= last.created_at);

        if is_latest {
            thread.last_message = Some(LastMessage::from(message));
        }
        if !already_seen && !is_from_self && !is_thread_open && !message.is_read {
            thread.unread_count += 1;
        }
        let unread_count = thread.unread_count;

        sort_threads(&mut self.threads);
        UpsertOutcome::Updated { unread_count }
    }

    /// Lowers the unread counter after `count` messages were marked read.
    pub fn apply_read(&mut self, thread_id: &ThreadId, count: u32) -> Option<u32> {
        let thread = self
            .threads
            .iter_mut()
            .find(|thread| &thread.thread_id == thread_id)?;
        thread.unread_count = thread.unread_count.saturating_sub(count);
        if thread.unread_count == 0 {
            if let Some(last) = thread.last_message.as_mut() {
                if last.sender_id == thread.participant.id {
                    last.is_read = true;
                }
            }
        }
        Some(thread.unread_count)
    }

    pub fn clear_unread(&mut self, thread_id: &ThreadId) -> bool {
        let Some(thread) = self
            .threads
            .iter_mut()
            .find(|thread| &thread.thread_id == thread_id)
        else {
            return false;
        };
        let changed = thread.unread_count != 0;
        thread.unread_count = 0;
        changed
    }
}

/// Stable sort, most recent activity first; threads without messages last.
pub fn sort_threads(threads: &mut [Thread]) {
    threads.sort_by(|a, b| match (a.last_activity(), b.last_activity()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn differs_materially(current: &[Thread], fetched: &[Thread]) -> bool {
    if current.len() != fetched.len() {
        return true;
    }
    match (current.first(), fetched.first()) {
        (Some(a), Some(b)) => {
            a.last_message.as_ref().map(|last| last.id) != b.last_message.as_ref().map(|last| last.id)
                || a.unread_count != b.unread_count
        }
        _ => false,
    }
}

#[cfg(test)]
#[path = "tests/thread_directory_tests.rs"]
mod tests;
