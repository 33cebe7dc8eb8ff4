use std::collections::{HashSet, VecDeque};

/// FIFO ring of sessions waiting for a worker slot.
///
/// A session joins at the tail when it becomes eligible for admission and
/// leaves from the head when admitted, so with `B` slots a session at
/// position `p` is admitted within `ceil(p / B)` admission rounds no matter
/// how deep anyone's backlog is. Membership is unique: re-adding a waiting
/// session keeps its position. Single-threaded, no internal synchronization.
#[derive(Default)]
pub struct FairRing {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl FairRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session at the tail. No-op if it is already waiting.
    pub fn push(&mut self, session_key: &str) -> bool {
        if !self.members.insert(session_key.to_string()) {
            return false;
        }
        self.order.push_back(session_key.to_string());
        true
    }

    /// Take the longest-waiting session.
    pub fn pop(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.members.remove(&key);
        Some(key)
    }

    /// The longest-waiting session, left in place.
    pub fn front(&self) -> Option<&str> {
        self.order.front().map(String::as_str)
    }

    pub fn remove(&mut self, session_key: &str) -> bool {
        if !self.members.remove(session_key) {
            return false;
        }
        if let Some(idx) = self.order.iter().position(|k| k == session_key) {
            self.order.remove(idx);
        }
        true
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.members.contains(session_key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Waiting sessions, head first.
    pub fn keys(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}
