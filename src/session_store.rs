/// # Session Store
///
/// In-memory, TTL-keyed storage for everything the gateway remembers about a browser
/// session. Each field of a session is stored under its own `(SessionId, SessionField)`
/// key so that the short-lived handshake data and the long-lived identity expire
/// independently.
///
/// ## Key Components:
///
/// - **`SessionStore`**: a `DashMap` of entries with first-write-wins `put`, `get` with an
///   atomic check-and-delete of expired entries, idempotent `delete`, and `sweep`. Every
///   successful `put` hands back a `WriteTicket`, so a writer can later check for or
///   remove exactly the value it stored.
///
/// - **`SessionSweeper`**: a background service that periodically drops expired entries
///   which were never read again.
///
/// Nothing is persisted. A restart forces every user to log in again.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use pingora::services::background::BackgroundService;
use thiserror::Error;

use crate::claims::Claims;
use crate::oidc::verifier::IdToken;
use crate::session_id::SessionId;

/// TTL of the handshake fields (`State`, `Nonce`, `RedirectTarget`).
pub const TRANSIENT_TTL: Duration = Duration::from_secs(3 * 60);
/// TTL of the identity fields (`IdToken`, `UserInfo`).
pub const AUTHENTICATED_TTL: Duration = Duration::from_secs(60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    State,
    Nonce,
    RedirectTarget,
    IdToken,
    UserInfo,
}

impl SessionField {
    pub const TRANSIENT: [SessionField; 3] = [
        SessionField::State,
        SessionField::Nonce,
        SessionField::RedirectTarget,
    ];
    pub const AUTHENTICATED: [SessionField; 2] = [SessionField::IdToken, SessionField::UserInfo];

    pub fn ttl(self) -> Duration {
        match self {
            SessionField::State | SessionField::Nonce | SessionField::RedirectTarget => {
                TRANSIENT_TTL
            }
            SessionField::IdToken | SessionField::UserInfo => AUTHENTICATED_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionValue {
    Text(String),
    IdToken(Arc<IdToken>),
    UserInfo(Arc<Claims>),
}

impl SessionValue {
    pub fn into_text(self) -> Option<String> {
        match self {
            SessionValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_id_token(self) -> Option<Arc<IdToken>> {
        match self {
            SessionValue::IdToken(token) => Some(token),
            _ => None,
        }
    }

    pub fn into_user_info(self) -> Option<Arc<Claims>> {
        match self {
            SessionValue::UserInfo(claims) => Some(claims),
            _ => None,
        }
    }
}

/// Returned by [`SessionStore::put`] when the slot already holds a live value.
#[derive(Debug, Error)]
#[error("session field {0:?} already holds a live value")]
pub struct SlotOccupied(pub SessionField);

/// Identifies one successful [`SessionStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket(u64);

struct StoredValue {
    value: SessionValue,
    expires_at: Instant,
    ticket: WriteTicket,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
pub struct SessionStore {
    entries: DashMap<(SessionId, SessionField), StoredValue>,
    next_ticket: AtomicU64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` unless the slot already holds a live one. An expired value does not
    /// block the write.
    pub fn put(
        &self,
        id: &SessionId,
        field: SessionField,
        value: SessionValue,
        ttl: Duration,
    ) -> Result<WriteTicket, SlotOccupied> {
        let now = Instant::now();
        let ticket = WriteTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let stored = StoredValue {
            value,
            expires_at: now + ttl,
            ticket,
        };
        match self.entries.entry((id.clone(), field)) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Err(SlotOccupied(field));
                }
                occupied.insert(stored);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
            }
        }
        Ok(ticket)
    }

    pub fn get(&self, id: &SessionId, field: SessionField) -> Option<SessionValue> {
        let key = (id.clone(), field);
        let now = Instant::now();
        if let Some(stored) = self.entries.get(&key) {
            if !stored.is_expired(now) {
                return Some(stored.value.clone());
            }
        }
        // The read guard is released before the conditional removal.
        self.entries.remove_if(&key, |_, stored| stored.is_expired(now));
        None
    }

    pub fn get_text(&self, id: &SessionId, field: SessionField) -> Option<String> {
        self.get(id, field).and_then(SessionValue::into_text)
    }

    pub fn delete(&self, id: &SessionId, field: SessionField) {
        self.entries.remove(&(id.clone(), field));
    }

    /// True while the slot holds the live value written under `ticket`.
    pub fn holds(&self, id: &SessionId, field: SessionField, ticket: WriteTicket) -> bool {
        let now = Instant::now();
        self.entries
            .get(&(id.clone(), field))
            .is_some_and(|stored| stored.ticket == ticket && !stored.is_expired(now))
    }

    /// Removes the value written under `ticket`. A value written by anyone else is kept.
    pub fn delete_written(&self, id: &SessionId, field: SessionField, ticket: WriteTicket) {
        self.entries
            .remove_if(&(id.clone(), field), |_, stored| stored.ticket == ticket);
    }

    pub fn delete_fields(&self, id: &SessionId, fields: &[SessionField]) {
        for field in fields {
            self.delete(id, *field);
        }
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A background service that periodically removes expired session entries.
pub struct SessionSweeper {
    store: Arc<SessionStore>,
    period: Duration,
}

impl SessionSweeper {
    pub fn new(store: Arc<SessionStore>, period: Duration) -> Self {
        SessionSweeper { store, period }
    }
}

#[async_trait]
impl BackgroundService for SessionSweeper {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("[SessionSweeper] Shutdown requested, stopping");
                    return;
                }
                _ = interval.tick() => {
                    let removed = self.store.sweep();
                    debug!(
                        "[SessionSweeper] Removed {} expired entries, {} remain",
                        removed,
                        self.store.len()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session() -> SessionId {
        SessionId::generate().unwrap()
    }

    fn text(value: &str) -> SessionValue {
        SessionValue::Text(value.to_string())
    }

    #[test]
    fn first_write_wins() {
        let store = SessionStore::new();
        let id = session();
        store
            .put(&id, SessionField::State, text("first"), TRANSIENT_TTL)
            .unwrap();
        let err = store
            .put(&id, SessionField::State, text("second"), TRANSIENT_TTL)
            .unwrap_err();
        assert_eq!(err.0, SessionField::State);
        assert_eq!(
            store.get_text(&id, SessionField::State).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn fields_and_sessions_are_keyed_independently() {
        let store = SessionStore::new();
        let (a, b) = (session(), session());
        for (id, field, value) in [
            (&a, SessionField::State, "a-state"),
            (&a, SessionField::Nonce, "a-nonce"),
            (&b, SessionField::State, "b-state"),
        ] {
            store.put(id, field, text(value), TRANSIENT_TTL).unwrap();
        }

        assert_eq!(
            store.get_text(&a, SessionField::Nonce).as_deref(),
            Some("a-nonce")
        );
        assert_eq!(
            store.get_text(&b, SessionField::State).as_deref(),
            Some("b-state")
        );
        assert!(store.get(&b, SessionField::Nonce).is_none());
    }

    #[test]
    fn expired_values_read_as_missing_and_are_removed() {
        let store = SessionStore::new();
        let id = session();
        store
            .put(&id, SessionField::Nonce, text("stale"), Duration::ZERO)
            .unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&id, SessionField::Nonce).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn expired_values_do_not_block_a_new_put() {
        let store = SessionStore::new();
        let id = session();
        store
            .put(&id, SessionField::State, text("stale"), Duration::ZERO)
            .unwrap();
        store
            .put(&id, SessionField::State, text("fresh"), TRANSIENT_TTL)
            .unwrap();
        assert_eq!(store.get_text(&id, SessionField::State).as_deref(), Some("fresh"));
    }

    #[test]
    fn delete_is_idempotent() {
        let store = SessionStore::new();
        let id = session();
        store.put(&id, SessionField::State, text("x"), TRANSIENT_TTL).unwrap();
        store.delete(&id, SessionField::State);
        store.delete(&id, SessionField::State);
        assert!(store.get(&id, SessionField::State).is_none());
        store.put(&id, SessionField::State, text("y"), TRANSIENT_TTL).unwrap();
    }

    #[test]
    fn tickets_identify_a_single_write() {
        let store = SessionStore::new();
        let id = session();
        let first = store
            .put(&id, SessionField::Nonce, text("mine"), TRANSIENT_TTL)
            .unwrap();
        assert!(store.holds(&id, SessionField::Nonce, first));

        store.delete(&id, SessionField::Nonce);
        let second = store
            .put(&id, SessionField::Nonce, text("mine"), TRANSIENT_TTL)
            .unwrap();
        assert_ne!(first, second);
        assert!(!store.holds(&id, SessionField::Nonce, first));

        // Same value, different writer: only the matching ticket removes it.
        store.delete_written(&id, SessionField::Nonce, first);
        assert_eq!(store.get_text(&id, SessionField::Nonce).as_deref(), Some("mine"));
        store.delete_written(&id, SessionField::Nonce, second);
        assert!(store.get(&id, SessionField::Nonce).is_none());
    }

    #[test]
    fn expired_writes_are_not_held() {
        let store = SessionStore::new();
        let id = session();
        let ticket = store
            .put(&id, SessionField::State, text("old"), Duration::ZERO)
            .unwrap();
        assert!(!store.holds(&id, SessionField::State, ticket));
    }

    #[test]
    fn sweep_only_removes_expired_entries() {
        let store = SessionStore::new();
        let id = session();
        store.put(&id, SessionField::State, text("old"), Duration::ZERO).unwrap();
        store.put(&id, SessionField::Nonce, text("old"), Duration::ZERO).unwrap();
        store
            .put(&id, SessionField::RedirectTarget, text("live"), TRANSIENT_TTL)
            .unwrap();
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(&id, SessionField::RedirectTarget).is_some());
    }

    #[test]
    fn concurrent_puts_admit_exactly_one_writer() {
        let store = Arc::new(SessionStore::new());
        let id = session();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                thread::spawn(move || {
                    store
                        .put(&id, SessionField::State, text(&format!("v{i}")), TRANSIENT_TTL)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn ttl_classes() {
        for field in SessionField::TRANSIENT {
            assert_eq!(field.ttl(), Duration::from_secs(180));
        }
        for field in SessionField::AUTHENTICATED {
            assert_eq!(field.ttl(), Duration::from_secs(3600));
        }
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let store = Arc::new(SessionStore::new());
        let sweeper = SessionSweeper::new(store, Duration::from_millis(5));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { sweeper.start(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
