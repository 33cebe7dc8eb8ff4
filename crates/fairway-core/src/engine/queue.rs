use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::message::{Delivery, LeaseToken, Message};

/// A buffered message and the lease it can currently be settled with.
/// `lease == None` means the message is waiting for the source to redeliver it.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub lease: Option<LeaseToken>,
}

/// Result of offering a delivery to a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New message appended at the tail.
    Appended,
    /// Redelivery of a message already buffered; its lease was refreshed in place.
    Refreshed,
    /// Not accepted; left to the source's lease expiry for redelivery.
    Deferred,
}

/// Per-session in-order buffer.
///
/// Arrival order is preserved and a message is never buffered twice. The
/// queue is only touched by the dispatcher thread; the session state decides
/// who may dequeue.
#[derive(Debug, Default)]
pub struct SessionQueue {
    /// Strictly increasing by sequence id.
    entries: VecDeque<QueuedMessage>,
    /// Message id → sequence id of every buffered entry.
    index: HashMap<Uuid, u64>,
    /// Lowest sequence id turned away by the depth cap. Everything after it is
    /// turned away too until it comes back, so the cap cannot reorder a session.
    resume_at: Option<u64>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, delivery: Delivery, max_depth: Option<usize>) -> EnqueueOutcome {
        let Delivery { message, lease } = delivery;

        if let Some(entry) = self.locate(&message.id).map(|i| &mut self.entries[i]) {
            entry.lease = Some(lease);
            entry.message.delivery_count = message.delivery_count;
            return EnqueueOutcome::Refreshed;
        }

        let seq = message.sequence_id;
        if self.resume_at.is_some_and(|r| seq > r) {
            return EnqueueOutcome::Deferred;
        }
        if max_depth.is_some_and(|max| self.entries.len() >= max) {
            self.resume_at = Some(self.resume_at.map_or(seq, |r| r.min(seq)));
            return EnqueueOutcome::Deferred;
        }
        if self.resume_at.is_some_and(|r| seq >= r) {
            self.resume_at = None;
        }

        self.index.insert(message.id, seq);
        self.entries.push_back(QueuedMessage {
            message,
            lease: Some(lease),
        });
        EnqueueOutcome::Appended
    }

    /// Position of a buffered message.
    fn locate(&self, message_id: &Uuid) -> Option<usize> {
        let seq = *self.index.get(message_id)?;
        match self
            .entries
            .binary_search_by_key(&seq, |e| e.message.sequence_id)
        {
            Ok(i) if self.entries[i].message.id == *message_id => Some(i),
            // A source that reuses sequence ids breaks the ordering
            _ => self.entries.iter().position(|e| e.message.id == *message_id),
        }
    }

    pub fn peek_head(&self) -> Option<&QueuedMessage> {
        self.entries.front()
    }

    /// The head exists and holds a live lease.
    pub fn head_ready(&self) -> bool {
        self.entries.front().is_some_and(|e| e.lease.is_some())
    }

    /// Remove the head if it is `message_id`. The in-flight message is always
    /// the head, so anything else is a stale report.
    pub fn dequeue(&mut self, message_id: &Uuid) -> Option<Message> {
        if self.entries.front()?.message.id != *message_id {
            return None;
        }
        self.index.remove(message_id);
        self.entries.pop_front().map(|e| e.message)
    }

    /// Forget the lease of one message, unless it was already refreshed by a
    /// newer delivery.
    pub fn clear_lease(&mut self, lease: &LeaseToken) {
        if let Some(entry) = self.locate(&lease.message_id).map(|i| &mut self.entries[i]) {
            if entry.lease.as_ref() == Some(lease) {
                entry.lease = None;
            }
        }
    }

    /// Forget every lease (session lock lost: the source releases them all).
    pub fn clear_leases(&mut self) {
        for entry in &mut self.entries {
            entry.lease = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn sequence_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.message.sequence_id).collect()
    }
}
