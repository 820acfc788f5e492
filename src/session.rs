//! Jump Session Manager.
//!
//! Owns one authenticated transport per [`JumpHostId`] and reference-counts it
//! across the forwards that use it. Acquire and release for the same identity
//! are serialized; different identities never wait on each other.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult},
    jump::{Credential, JumpHost, JumpHostId},
    transport::{SshTransport, TransportSession},
};

/// Live session shared by the forwards of one jump host
pub struct Session {
    id: JumpHostId,
    transport: Arc<dyn TransportSession>,
    refs: AtomicUsize,
    closing: AtomicBool,
    /// `Some(reason)` once the transport is gone
    lost: watch::Sender<Option<String>>,
}

impl Session {
    pub fn id(&self) -> &JumpHostId {
        &self.id
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.lost.borrow().is_none()
    }

    fn mark_lost(&self, reason: String) {
        self.lost.send_if_modified(|lost| {
            if lost.is_none() {
                *lost = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("refs", &self.ref_count())
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    /// Serializes acquire/release for one identity
    op: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Session>>>,
}

impl Slot {
    fn current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget `session` if it is still the one handed out for this identity
    fn discard(&self, session: &Arc<Session>) {
        let mut current = self.current();
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: JumpHostId,
    pub refs: usize,
    pub alive: bool,
}

pub struct SessionManager {
    transport: Arc<dyn SshTransport>,
    connect_timeout: Duration,
    slots: Mutex<HashMap<JumpHostId, Arc<Slot>>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn SshTransport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the live session for `jump` or establish a new one
    pub async fn acquire(&self, jump: &JumpHost, credential: &Credential) -> TunnelResult<SessionHandle> {
        let id = jump.id();
        let slot = self.slot(&id);
        let _op = slot.op.lock().await;

        let existing = slot.current().clone();
        if let Some(session) = existing {
            if session.is_alive() {
                let refs = session.refs.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Reusing session {} (refs={})", id, refs);
                return Ok(SessionHandle::new(session, slot.clone()));
            }
            slot.discard(&session);
        }

        let transport = self
            .transport
            .connect(jump, credential, self.connect_timeout)
            .await?;

        let (lost, _) = watch::channel(None);
        let session = Arc::new(Session {
            id: id.clone(),
            transport,
            refs: AtomicUsize::new(1),
            closing: AtomicBool::new(false),
            lost,
        });
        *slot.current() = Some(Arc::clone(&session));
        spawn_closure_watch(Arc::clone(&session), Arc::downgrade(&slot));

        info!("Session {} established", id);
        Ok(SessionHandle::new(session, slot.clone()))
    }

    /// Take another reference on the session behind `handle`
    pub async fn retain(&self, handle: &SessionHandle) -> TunnelResult<SessionHandle> {
        let _op = handle.slot.op.lock().await;
        if handle.is_released() || !handle.session.is_alive() {
            return Err(TunnelError::transport(format!(
                "Session {} is no longer available",
                handle.session.id
            )));
        }
        handle.session.refs.fetch_add(1, Ordering::SeqCst);
        Ok(SessionHandle::new(
            Arc::clone(&handle.session),
            Arc::clone(&handle.slot),
        ))
    }

    /// Drop one reference; the last one closes the transport. Idempotent per handle.
    pub async fn release(&self, handle: &SessionHandle) {
        handle.release().await;
    }

    /// Current session for `id`, if any
    pub fn session_info(&self, id: &JumpHostId) -> Option<SessionInfo> {
        let slot = self.lock_slots().get(id).cloned()?;
        let current = slot.current().clone();
        current.map(|session| SessionInfo {
            id: session.id.clone(),
            refs: session.ref_count(),
            alive: session.is_alive(),
        })
    }

    /// All sessions currently handed out
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let slots: Vec<Arc<Slot>> = self.lock_slots().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.current().clone())
            .map(|session| SessionInfo {
                id: session.id.clone(),
                refs: session.ref_count(),
                alive: session.is_alive(),
            })
            .collect()
    }

    fn slot(&self, id: &JumpHostId) -> Arc<Slot> {
        let mut slots = self.lock_slots();
        // A slot nobody references and without a session belongs to a jump host no longer in use
        slots.retain(|_, slot| Arc::strong_count(slot) > 1 || slot.current().is_some());
        Arc::clone(slots.entry(id.clone()).or_default())
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<JumpHostId, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Broadcast an unexpected transport closure to every holder of the session
fn spawn_closure_watch(session: Arc<Session>, slot: Weak<Slot>) {
    tokio::spawn(async move {
        session.transport.closed().await;
        if session.closing.load(Ordering::SeqCst) {
            session.mark_lost("session closed".to_string());
            return;
        }

        warn!(
            "Session {} lost with {} forward(s) attached",
            session.id,
            session.ref_count()
        );
        session.mark_lost(format!("Session to {} closed unexpectedly", session.id));
        if let Some(slot) = slot.upgrade() {
            slot.discard(&session);
        }
    });
}

/// One counted reference to a [`Session`]
pub struct SessionHandle {
    session: Arc<Session>,
    slot: Arc<Slot>,
    released: AtomicBool,
}

impl SessionHandle {
    fn new(session: Arc<Session>, slot: Arc<Slot>) -> Self {
        Self {
            session,
            slot,
            released: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.session.transport
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Receiver that turns `Some(reason)` when the transport goes away
    pub fn lost(&self) -> watch::Receiver<Option<String>> {
        self.session.lost.subscribe()
    }

    /// Drop this reference. Releasing twice is a no-op.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        release_reference(Arc::clone(&self.session), Arc::clone(&self.slot)).await;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(&self.session);
        let slot = Arc::clone(&self.slot);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release_reference(session, slot));
            }
            Err(_) => {
                session.refs.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

async fn release_reference(session: Arc<Session>, slot: Arc<Slot>) {
    let _op = slot.op.lock().await;
    let remaining = session.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    debug!("Released session {} (refs={})", session.id, remaining);
    if remaining > 0 {
        return;
    }

    session.closing.store(true, Ordering::SeqCst);
    slot.discard(&session);
    session.transport.disconnect().await;
    info!("Session {} closed", session.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    fn jump() -> JumpHost {
        JumpHost::new("bastion", 22, "ops")
    }

    fn credential() -> Credential {
        Credential::Password("secret".into())
    }

    fn manager(transport: &Arc<FakeTransport>) -> SessionManager {
        SessionManager::new(transport.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_session() {
        let transport = FakeTransport::new();
        let sessions = manager(&transport);

        let a = sessions.acquire(&jump(), &credential()).await.unwrap();
        let b = sessions.acquire(&jump(), &credential()).await.unwrap();

        assert_eq!(transport.connects(), 1);
        assert!(Arc::ptr_eq(a.session(), b.session()));
        assert_eq!(sessions.session_info(&jump().id()).unwrap().refs, 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_closes_at_zero() {
        let transport = FakeTransport::new();
        let sessions = manager(&transport);

        let a = sessions.acquire(&jump(), &credential()).await.unwrap();
        let b = sessions.acquire(&jump(), &credential()).await.unwrap();

        sessions.release(&a).await;
        sessions.release(&a).await;
        assert_eq!(sessions.session_info(&jump().id()).unwrap().refs, 1);

        sessions.release(&b).await;
        assert!(sessions.session_info(&jump().id()).is_none());
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(a.session().ref_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_connects_once() {
        let transport = FakeTransport::new();
        transport.set_connect_delay(Duration::from_millis(50));
        let sessions = Arc::new(manager(&transport));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let sessions = Arc::clone(&sessions);
            tasks.push(tokio::spawn(async move {
                sessions.acquire(&jump(), &credential()).await.unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(transport.connects(), 1);
        assert_eq!(sessions.session_info(&jump().id()).unwrap().refs, 5);
    }

    #[tokio::test]
    async fn test_authentication_failure_is_reported() {
        let transport = FakeTransport::new();
        transport.reject_credentials(true);
        let sessions = manager(&transport);

        let err = sessions.acquire(&jump(), &credential()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Authentication(_)));
        assert!(sessions.session_info(&jump().id()).is_none());
    }

    #[tokio::test]
    async fn test_lost_session_is_broadcast_and_not_reused() {
        let transport = FakeTransport::new();
        let sessions = manager(&transport);

        let a = sessions.acquire(&jump(), &credential()).await.unwrap();
        let b = sessions.acquire(&jump(), &credential()).await.unwrap();
        let mut lost_a = a.lost();
        let mut lost_b = b.lost();

        transport.drop_sessions();

        lost_a.wait_for(|r| r.is_some()).await.unwrap();
        lost_b.wait_for(|r| r.is_some()).await.unwrap();
        assert!(!a.session().is_alive());

        let c = sessions.acquire(&jump(), &credential()).await.unwrap();
        assert!(!Arc::ptr_eq(a.session(), c.session()));
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test]
    async fn test_retain_counts_reference() {
        let transport = FakeTransport::new();
        let sessions = manager(&transport);

        let group = sessions.acquire(&jump(), &credential()).await.unwrap();
        let forward = sessions.retain(&group).await.unwrap();
        sessions.release(&group).await;

        assert_eq!(forward.session().ref_count(), 1);
        assert!(forward.session().is_alive());
        assert!(sessions.retain(&group).await.is_err());
    }

    #[tokio::test]
    async fn test_unused_jump_hosts_are_forgotten() {
        let transport = FakeTransport::new();
        let sessions = manager(&transport);

        let first = sessions.acquire(&jump(), &credential()).await.unwrap();
        sessions.release(&first).await;
        drop(first);

        let other = JumpHost::new("bastion-2", 22, "ops");
        let second = sessions.acquire(&other, &credential()).await.unwrap();
        assert_eq!(sessions.lock_slots().len(), 1);
        assert!(sessions.lock_slots().contains_key(&other.id()));

        // A failed attempt leaves nothing behind either
        transport.reject_credentials(true);
        let third = JumpHost::new("bastion-3", 22, "ops");
        assert!(sessions.acquire(&third, &credential()).await.is_err());
        sessions.release(&second).await;
        drop(second);
        sessions.acquire(&jump(), &credential()).await.unwrap_err();
        assert_eq!(sessions.lock_slots().len(), 1);
    }
}
