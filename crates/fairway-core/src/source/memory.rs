use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{LockToken, LossNotifier, MessageSource, SessionLock};
use crate::error::{SourceError, SourceResult};
use crate::message::{now_nanos, Delivery, LeaseToken, Message, MessageReceipt, OutboundMessage};

/// Lease and lock durations for the in-memory source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySourceConfig {
    /// How long a delivered message stays invisible before it is reclaimed
    /// and redelivered.
    pub visibility_timeout_ms: u64,
    /// How long a session lock lives without renewal.
    pub session_lock_ms: u64,
}

impl Default for MemorySourceConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
            session_lock_ms: 60_000,
        }
    }
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

struct Stored {
    message: Message,
    lease: Option<Lease>,
}

struct HeldLock {
    epoch: u64,
    expires_at: Instant,
    on_lost: LossNotifier,
}

type Notification = (LossNotifier, LockToken);

#[derive(Default)]
struct State {
    /// Arrival order → message. Delivery scans in this order.
    messages: BTreeMap<u64, Stored>,
    order_by_id: HashMap<Uuid, u64>,
    /// Orders of messages without a lease, ready for delivery.
    unleased: BTreeSet<u64>,
    /// (expiry, order) of every outstanding lease.
    expiries: BTreeSet<(Instant, u64)>,
    /// Orders of leased messages, per session.
    leased_by_session: HashMap<String, BTreeSet<u64>>,
    next_order: u64,
    sequences: HashMap<String, u64>,
    locks: HashMap<String, HeldLock>,
    next_epoch: u64,
    completed: Vec<Message>,
    dead_letters: Vec<(Message, String)>,
    closed: bool,
    fault: Option<String>,
}

impl State {
    fn check_open(&self) -> SourceResult<()> {
        if let Some(reason) = &self.fault {
            return Err(SourceError::Transport(reason.clone()));
        }
        if self.closed {
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    /// Drop the lease of a stored message and make it deliverable again.
    fn return_to_pool(&mut self, order: u64) {
        let Some(stored) = self.messages.get_mut(&order) else {
            return;
        };
        let Some(lease) = stored.lease.take() else {
            return;
        };
        stored.message.delivery_count += 1;
        self.expiries.remove(&(lease.expires_at, order));
        if let Some(orders) = self.leased_by_session.get_mut(&stored.message.session_key) {
            orders.remove(&order);
            if orders.is_empty() {
                self.leased_by_session.remove(&stored.message.session_key);
            }
        }
        self.unleased.insert(order);
    }

    /// Reclaim expired message leases and expired session locks.
    fn expire(&mut self, now: Instant, notes: &mut Vec<Notification>) {
        let lapsed: Vec<u64> = self
            .expiries
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .map(|(_, order)| *order)
            .collect();
        for order in lapsed {
            self.return_to_pool(order);
        }

        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, held)| held.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            debug!(session_key = %key, "session lock expired");
            self.drop_lock(&key, notes);
        }
    }

    /// Remove a session lock and make every leased message of that session
    /// redeliverable.
    fn drop_lock(&mut self, session_key: &str, notes: &mut Vec<Notification>) -> bool {
        let Some(held) = self.locks.remove(session_key) else {
            return false;
        };
        let leased = self.leased_by_session.remove(session_key).unwrap_or_default();
        for order in leased {
            self.return_to_pool(order);
        }
        notes.push((
            held.on_lost,
            LockToken {
                session_key: session_key.to_string(),
                epoch: held.epoch,
            },
        ));
        true
    }

    fn lease_available(&mut self, max: usize, now: Instant, visibility: Duration) -> Vec<Delivery> {
        let expires_at = now + visibility;
        let picked: Vec<u64> = self.unleased.iter().take(max).copied().collect();
        let mut batch = Vec::with_capacity(picked.len());
        for order in picked {
            self.unleased.remove(&order);
            let Some(stored) = self.messages.get_mut(&order) else {
                continue;
            };
            let token = Uuid::now_v7();
            stored.lease = Some(Lease { token, expires_at });
            self.expiries.insert((expires_at, order));
            self.leased_by_session
                .entry(stored.message.session_key.clone())
                .or_default()
                .insert(order);
            batch.push(Delivery {
                message: stored.message.clone(),
                lease: LeaseToken {
                    message_id: stored.message.id,
                    token,
                },
            });
        }
        batch
    }

    fn check_lock(&self, lock: &LockToken, now: Instant) -> SourceResult<()> {
        match self.locks.get(&lock.session_key) {
            Some(held) if held.epoch == lock.epoch && held.expires_at > now => Ok(()),
            _ => Err(SourceError::SessionLockLost(lock.to_string())),
        }
    }

    /// Validate a lease and take the message out of the store.
    fn take_leased(&mut self, lease: &LeaseToken, now: Instant) -> SourceResult<Message> {
        let order = self
            .order_by_id
            .get(&lease.message_id)
            .copied()
            .ok_or(SourceError::LeaseNotFound(lease.message_id))?;
        let valid = self.messages.get(&order).is_some_and(|stored| {
            stored
                .lease
                .as_ref()
                .is_some_and(|l| l.token == lease.token && l.expires_at > now)
        });
        if !valid {
            return Err(SourceError::LeaseNotFound(lease.message_id));
        }
        self.order_by_id.remove(&lease.message_id);
        let stored = self
            .messages
            .remove(&order)
            .ok_or(SourceError::LeaseNotFound(lease.message_id))?;
        if let Some(l) = &stored.lease {
            self.expiries.remove(&(l.expires_at, order));
        }
        if let Some(orders) = self.leased_by_session.get_mut(&stored.message.session_key) {
            orders.remove(&order);
            if orders.is_empty() {
                self.leased_by_session.remove(&stored.message.session_key);
            }
        }
        Ok(stored.message)
    }
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    config: MemorySourceConfig,
}

impl Shared {
    fn fire(notes: Vec<Notification>) {
        for (on_lost, token) in notes {
            on_lost(token);
        }
    }
}

/// In-process message source with peek-lock semantics, visibility timeouts
/// and expiring session locks. Clones share the same store.
#[derive(Clone)]
pub struct MemorySource {
    shared: Arc<Shared>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(MemorySourceConfig::default())
    }
}

impl MemorySource {
    pub fn new(config: MemorySourceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                available: Condvar::new(),
                config,
            }),
        }
    }

    /// Forcibly take a session lock away from its holder. The holder's loss
    /// notifier fires and every leased message of the session becomes
    /// redeliverable. Returns false if nobody held the lock.
    pub fn revoke_session(&self, session_key: &str) -> bool {
        let mut notes = Vec::new();
        let revoked = self.shared.state.lock().drop_lock(session_key, &mut notes);
        if revoked {
            warn!(%session_key, "session lock revoked");
            self.shared.available.notify_all();
        }
        Shared::fire(notes);
        revoked
    }

    /// Make every subsequent call fail with a transport error.
    pub fn inject_fault(&self, reason: impl Into<String>) {
        self.shared.state.lock().fault = Some(reason.into());
        self.shared.available.notify_all();
    }

    #[cfg(test)]
    pub fn clear_fault(&self) {
        self.shared.state.lock().fault = None;
    }

    /// Messages acknowledged so far, in completion order.
    pub fn completed(&self) -> Vec<Message> {
        self.shared.state.lock().completed.clone()
    }

    pub fn dead_letters(&self) -> Vec<(Message, String)> {
        self.shared.state.lock().dead_letters.clone()
    }

    /// Messages still stored (leased or not).
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().messages.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Epoch of the current holder of a session lock, if any.
    pub fn lock_epoch(&self, session_key: &str) -> Option<u64> {
        let now = Instant::now();
        self.shared
            .state
            .lock()
            .locks
            .get(session_key)
            .filter(|held| held.expires_at > now)
            .map(|held| held.epoch)
    }
}

impl MessageSource for MemorySource {
    fn send(&self, outbound: OutboundMessage) -> SourceResult<MessageReceipt> {
        let mut state = self.shared.state.lock();
        state.check_open()?;

        let sequence = state.sequences.entry(outbound.session_key.clone()).or_insert(0);
        *sequence += 1;
        let sequence_id = *sequence;

        let message = Message {
            id: Message::new_id(),
            session_key: outbound.session_key,
            sequence_id,
            payload: outbound.payload,
            content_type: outbound.content_type,
            delivery_count: 0,
            enqueued_at: now_nanos(),
        };
        let receipt = MessageReceipt {
            id: message.id,
            sequence_id,
        };

        let order = state.next_order;
        state.next_order += 1;
        state.order_by_id.insert(message.id, order);
        state.unleased.insert(order);
        state.messages.insert(
            order,
            Stored {
                message,
                lease: None,
            },
        );
        drop(state);

        self.shared.available.notify_all();
        Ok(receipt)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> SourceResult<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        let visibility = Duration::from_millis(self.shared.config.visibility_timeout_ms);
        let mut notes = Vec::new();
        let mut state = self.shared.state.lock();

        let result = loop {
            if let Err(e) = state.check_open() {
                break Err(e);
            }
            let now = Instant::now();
            state.expire(now, &mut notes);

            let batch = state.lease_available(max_messages, now, visibility);
            if !batch.is_empty() || now >= deadline {
                break Ok(batch);
            }
            self.shared.available.wait_until(&mut state, deadline);
        };
        drop(state);

        Shared::fire(notes);
        result
    }

    fn complete(&self, lock: &LockToken, lease: &LeaseToken) -> SourceResult<()> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.check_open()?;
        state.check_lock(lock, now)?;
        let message = state.take_leased(lease, now)?;
        state.completed.push(message);
        Ok(())
    }

    fn abandon(&self, lease: &LeaseToken) -> SourceResult<()> {
        let mut state = self.shared.state.lock();
        state.check_open()?;
        let order = state
            .order_by_id
            .get(&lease.message_id)
            .copied()
            .ok_or(SourceError::LeaseNotFound(lease.message_id))?;
        let held = state
            .messages
            .get(&order)
            .is_some_and(|s| s.lease.as_ref().is_some_and(|l| l.token == lease.token));
        if !held {
            return Err(SourceError::LeaseNotFound(lease.message_id));
        }
        state.return_to_pool(order);
        drop(state);

        self.shared.available.notify_all();
        Ok(())
    }

    fn dead_letter(&self, lock: &LockToken, lease: &LeaseToken, reason: &str) -> SourceResult<()> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.check_open()?;
        state.check_lock(lock, now)?;
        let message = state.take_leased(lease, now)?;
        state.dead_letters.push((message, reason.to_string()));
        Ok(())
    }

    fn accept_session(
        &self,
        session_key: &str,
        on_lost: LossNotifier,
    ) -> SourceResult<Arc<dyn SessionLock>> {
        let now = Instant::now();
        let mut notes = Vec::new();
        let mut state = self.shared.state.lock();
        state.check_open()?;
        state.expire(now, &mut notes);

        let result = if state.locks.contains_key(session_key) {
            Err(SourceError::SessionLockUnavailable(session_key.to_string()))
        } else {
            state.next_epoch += 1;
            let epoch = state.next_epoch;
            state.locks.insert(
                session_key.to_string(),
                HeldLock {
                    epoch,
                    expires_at: now + Duration::from_millis(self.shared.config.session_lock_ms),
                    on_lost,
                },
            );
            let lock: Arc<dyn SessionLock> = Arc::new(MemorySessionLock {
                shared: Arc::clone(&self.shared),
                token: LockToken {
                    session_key: session_key.to_string(),
                    epoch,
                },
            });
            Ok(lock)
        };
        drop(state);

        Shared::fire(notes);
        result
    }

    fn close(&self) -> SourceResult<()> {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
        debug!("memory source closed");
        Ok(())
    }
}

struct MemorySessionLock {
    shared: Arc<Shared>,
    token: LockToken,
}

impl SessionLock for MemorySessionLock {
    fn token(&self) -> LockToken {
        self.token.clone()
    }

    fn renew(&self) -> SourceResult<()> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.check_open()?;
        match state.locks.get_mut(&self.token.session_key) {
            Some(held) if held.epoch == self.token.epoch && held.expires_at > now => {
                held.expires_at = now + Duration::from_millis(self.shared.config.session_lock_ms);
                Ok(())
            }
            _ => Err(SourceError::SessionLockLost(self.token.to_string())),
        }
    }

    fn release(&self) -> SourceResult<()> {
        let mut state = self.shared.state.lock();
        if state
            .locks
            .get(&self.token.session_key)
            .is_some_and(|held| held.epoch == self.token.epoch)
        {
            state.locks.remove(&self.token.session_key);
        }
        Ok(())
    }

    fn is_lost(&self) -> bool {
        let now = Instant::now();
        !self
            .shared
            .state
            .lock()
            .locks
            .get(&self.token.session_key)
            .is_some_and(|held| held.epoch == self.token.epoch && held.expires_at > now)
    }
}
