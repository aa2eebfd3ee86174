//! Concurrent session registry with idle eviction.
//!
//! Each record moves through `Absent → Active → {Completed | Expired}`. A
//! completed session is simply removed and its identifier may be used again;
//! an expired one is removed *and* its identifier is retired for the life of
//! the process.
//!
//! The session map and the retired set sit behind a single mutex that is held
//! only for the map operation itself, never across socket I/O. Timer expiries
//! are not applied by the timer tasks directly: they are sent to a reaper task
//! owned by the store, which applies them under the same lock and ignores any
//! expiry from a timer that no longer belongs to the live record.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::checksum::{self, Checksum, ChecksumError};
use crate::sequence;
use crate::timer::{EvictionTimer, Expired, TimerIdGenerator};

/// Opaque client-supplied session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a client-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw identifier bytes; the sequence seed is taken from these.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Why a session left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The client drained the sequence and received its checksum.
    Completed,
    /// The idle deadline elapsed; the identifier is retired.
    Expired,
}

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The identifier previously timed out and can never be reused.
    #[error("client id {0} went away and is reserved")]
    IdentifierRetired(SessionId),

    /// The requested starting progress exceeds the sequence length.
    #[error("progress {progress} exceeds sequence length {length}")]
    ProgressOutOfRange {
        /// Requested progress.
        progress: u32,
        /// Sequence length.
        length: u32,
    },
}

/// Point-in-time view of a session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Total number of values, fixed at creation.
    pub length: u32,
    /// Index of the next value to deliver.
    pub progress: u32,
}

impl SessionInfo {
    /// Whether every value has been delivered.
    pub fn is_drained(&self) -> bool {
        self.progress >= self.length
    }
}

struct Session {
    length: u32,
    progress: u32,
    timer: Option<EvictionTimer>,
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<SessionId, Session>,
    retired: HashSet<SessionId>,
}

impl StoreState {
    fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| SessionInfo {
            id: id.clone(),
            length: s.length,
            progress: s.progress,
        })
    }

    fn remove(&mut self, id: &SessionId, cause: Removal) -> Option<SessionInfo> {
        let info = self.info(id);
        // Dropping the record drops (and so cancels) its timer.
        self.sessions.remove(id);
        if cause == Removal::Expired {
            self.retired.insert(id.clone());
        }
        info
    }
}

/// Shared registry of resumable sessions.
pub struct SessionStore {
    state: Arc<Mutex<StoreState>>,
    idle_deadline: Duration,
    timer_ids: TimerIdGenerator,
    expired_tx: mpsc::UnboundedSender<Expired>,
    reaper: JoinHandle<()>,
}

impl SessionStore {
    /// Create an empty store whose sessions expire after `idle_deadline`
    /// without a keepalive. Must be called within a tokio runtime.
    pub fn new(idle_deadline: Duration) -> Self {
        let state = Arc::new(Mutex::new(StoreState::default()));
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(Self::reap(Arc::clone(&state), expired_rx));
        Self {
            state,
            idle_deadline,
            timer_ids: TimerIdGenerator::new(),
            expired_tx,
            reaper,
        }
    }

    /// The configured idle deadline.
    pub fn idle_deadline(&self) -> Duration {
        self.idle_deadline
    }

    /// Whether a live record exists for `id`.
    pub async fn has(&self, id: &SessionId) -> bool {
        self.state.lock().await.sessions.contains_key(id)
    }

    /// Whether `id` was retired by a timeout.
    pub async fn is_retired(&self, id: &SessionId) -> bool {
        self.state.lock().await.retired.contains(id)
    }

    /// Insert a new record and arm its eviction timer.
    ///
    /// An existing record under the same identifier is replaced (last write
    /// wins); callers are expected to check [`has`](Self::has) first.
    pub async fn create(
        &self,
        id: SessionId,
        length: u32,
        resume_from: Option<u32>,
    ) -> Result<(), StoreError> {
        let progress = resume_from.unwrap_or(0);
        if progress > length {
            return Err(StoreError::ProgressOutOfRange { progress, length });
        }

        let mut state = self.state.lock().await;
        if state.retired.contains(&id) {
            return Err(StoreError::IdentifierRetired(id));
        }

        let timer = EvictionTimer::arm(
            id.clone(),
            self.timer_ids.next_id(),
            self.idle_deadline,
            self.expired_tx.clone(),
        );
        let session = Session {
            length,
            progress,
            timer: Some(timer),
        };
        if state.sessions.insert(id.clone(), session).is_some() {
            tracing::warn!("Session {id} replaced by a concurrent create");
        }
        tracing::info!("Created session {id} (length={length}, progress={progress})");
        Ok(())
    }

    /// Snapshot of the record for `id`, if live.
    pub async fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.state.lock().await.info(id)
    }

    /// Move progress forward by one, saturating at the sequence length.
    pub async fn advance(&self, id: &SessionId) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(id) {
            session.progress = (session.progress + 1).min(session.length);
        }
    }

    /// Keepalive: push the eviction deadline out by the full idle period.
    pub async fn touch(&self, id: &SessionId) {
        if let Some(timer) = self
            .state
            .lock()
            .await
            .sessions
            .get(id)
            .and_then(|s| s.timer.as_ref())
        {
            timer.reset();
        }
    }

    /// Disarm the eviction timer without removing the record.
    pub async fn cancel_timer(&self, id: &SessionId) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(id) {
            session.timer = None;
        }
    }

    /// Delete the record for `id`. Only [`Removal::Expired`] retires the
    /// identifier.
    pub async fn remove(&self, id: &SessionId, cause: Removal) -> Option<SessionInfo> {
        let removed = self.state.lock().await.remove(id, cause);
        if removed.is_some() {
            tracing::info!("Removed session {id} ({cause:?})");
        }
        removed
    }

    /// Checksum over the full sequence of the live session `id`.
    ///
    /// The lock is released before the O(length) replay.
    pub async fn checksum(&self, id: &SessionId) -> Result<Option<Checksum>, ChecksumError> {
        let Some(info) = self.get(id).await else {
            return Ok(None);
        };
        checksum::checksum(sequence::seed_for(id), info.length).map(Some)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.sessions.is_empty()
    }

    /// Apply timer expiries under the store lock.
    async fn reap(state: Arc<Mutex<StoreState>>, mut expired_rx: mpsc::UnboundedReceiver<Expired>) {
        while let Some(Expired { session, timer }) = expired_rx.recv().await {
            let mut state = state.lock().await;
            let current = state
                .sessions
                .get(&session)
                .and_then(|s| s.timer.as_ref())
                .map(EvictionTimer::id);
            if current != Some(timer) {
                tracing::debug!("Ignoring stale expiry for session {session}");
                continue;
            }
            state.remove(&session, Removal::Expired);
            tracing::warn!("Session {session} expired; identifier retired");
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerId;

    const IDLE: Duration = Duration::from_secs(30);

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    async fn wait_until_absent(store: &SessionStore, id: &SessionId) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.has(id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session was never evicted");
    }

    #[tokio::test]
    async fn test_has_follows_lifecycle() {
        let store = SessionStore::new(IDLE);
        let id = sid("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");

        assert!(!store.has(&id).await);
        store.create(id.clone(), 3, None).await.unwrap();
        assert!(store.has(&id).await);
        store.remove(&id, Removal::Completed).await;
        assert!(!store.has(&id).await);
    }

    #[tokio::test]
    async fn test_create_sets_progress() {
        let store = SessionStore::new(IDLE);
        store.create(sid("a"), 10, Some(4)).await.unwrap();
        let info = store.get(&sid("a")).await.unwrap();
        assert_eq!(info.length, 10);
        assert_eq!(info.progress, 4);

        store.create(sid("b"), 10, None).await.unwrap();
        assert_eq!(store.get(&sid("b")).await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_progress_past_length() {
        let store = SessionStore::new(IDLE);
        let result = store.create(sid("a"), 2, Some(3)).await;
        assert_eq!(
            result,
            Err(StoreError::ProgressOutOfRange {
                progress: 3,
                length: 2
            })
        );
        assert!(!store.has(&sid("a")).await);
    }

    #[tokio::test]
    async fn test_advance_saturates_at_length() {
        let store = SessionStore::new(IDLE);
        store.create(sid("a"), 2, None).await.unwrap();
        for _ in 0..5 {
            store.advance(&sid("a")).await;
        }
        let info = store.get(&sid("a")).await.unwrap();
        assert_eq!(info.progress, 2);
        assert!(info.is_drained());
    }

    #[tokio::test]
    async fn test_operations_on_absent_id_are_noops() {
        let store = SessionStore::new(IDLE);
        let id = sid("ghost");
        store.touch(&id).await;
        store.advance(&id).await;
        store.cancel_timer(&id).await;
        assert!(store.remove(&id, Removal::Completed).await.is_none());
        assert!(store.get(&id).await.is_none());
        assert_eq!(store.checksum(&id).await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_deadline_expires_and_retires() {
        let store = SessionStore::new(Duration::from_millis(30));
        let id = sid("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        store.create(id.clone(), 5, None).await.unwrap();

        wait_until_absent(&store, &id).await;
        assert!(store.is_retired(&id).await);
        assert_eq!(
            store.create(id.clone(), 5, None).await,
            Err(StoreError::IdentifierRetired(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_retired_rejects_any_parameters() {
        let store = SessionStore::new(Duration::from_millis(10));
        let id = sid("r");
        store.create(id.clone(), 1, None).await.unwrap();
        wait_until_absent(&store, &id).await;

        for (length, resume) in [(1, None), (65535, Some(0)), (7, Some(7))] {
            let result = store.create(id.clone(), length, resume).await;
            assert!(matches!(result, Err(StoreError::IdentifierRetired(_))));
        }
        assert!(!store.has(&id).await);
    }

    #[tokio::test]
    async fn test_touch_keeps_session_alive() {
        let store = SessionStore::new(Duration::from_millis(150));
        let id = sid("kept");
        store.create(id.clone(), 5, None).await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.touch(&id).await;
        }
        assert!(store.has(&id).await, "touched session must survive");
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_expires() {
        let store = SessionStore::new(Duration::from_millis(20));
        let id = sid("done");
        store.create(id.clone(), 5, None).await.unwrap();
        store.cancel_timer(&id).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.has(&id).await);
        assert!(!store.is_retired(&id).await);
    }

    #[tokio::test]
    async fn test_completed_identifier_is_reusable() {
        let store = SessionStore::new(IDLE);
        let id = sid("again");
        store.create(id.clone(), 3, None).await.unwrap();
        let removed = store.remove(&id, Removal::Completed).await.unwrap();
        assert_eq!(removed.length, 3);

        assert!(!store.is_retired(&id).await);
        store.create(id.clone(), 8, None).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().length, 8);
    }

    #[tokio::test]
    async fn test_expired_removal_retires() {
        let store = SessionStore::new(IDLE);
        let id = sid("manual");
        store.create(id.clone(), 3, None).await.unwrap();
        store.remove(&id, Removal::Expired).await;
        assert!(store.is_retired(&id).await);
        assert!(!store.has(&id).await);
    }

    async fn live_timer_id(store: &SessionStore, id: &SessionId) -> Option<TimerId> {
        store
            .state
            .lock()
            .await
            .sessions
            .get(id)
            .and_then(|s| s.timer.as_ref())
            .map(EvictionTimer::id)
    }

    #[tokio::test]
    async fn test_stale_expiry_does_not_evict_successor() {
        let store = SessionStore::new(IDLE);
        let id = sid("successor");
        store.create(id.clone(), 3, None).await.unwrap();
        let first = live_timer_id(&store, &id).await.unwrap();
        store.remove(&id, Removal::Completed).await;

        // The successor's timer stays armed; only the id differs.
        store.create(id.clone(), 3, None).await.unwrap();
        let second = live_timer_id(&store, &id).await.unwrap();
        assert_ne!(first, second);

        store
            .expired_tx
            .send(Expired {
                session: id.clone(),
                timer: first,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.has(&id).await);
        assert!(!store.is_retired(&id).await);
        assert_eq!(live_timer_id(&store, &id).await, Some(second));

        // The same message carrying the live timer's id does evict.
        store
            .expired_tx
            .send(Expired {
                session: id.clone(),
                timer: second,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.has(&id).await);
        assert!(store.is_retired(&id).await);
    }

    #[tokio::test]
    async fn test_checksum_uses_full_length() {
        let store = SessionStore::new(IDLE);
        let id = sid("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        store.create(id.clone(), 4, Some(3)).await.unwrap();

        let expected = checksum::checksum(sequence::seed_for(&id), 4).unwrap();
        assert_eq!(store.checksum(&id).await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_concurrent_creates_for_distinct_ids() {
        let store = Arc::new(SessionStore::new(IDLE));
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = SessionId::new(format!("session-{i:02}"));
                store.create(id.clone(), 10, None).await.unwrap();
                store.advance(&id).await;
                store.touch(&id).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len().await, 32);
        assert_eq!(
            store.get(&sid("session-07")).await.unwrap().progress,
            1
        );
    }
}
