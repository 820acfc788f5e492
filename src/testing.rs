//! In-memory transport used by unit tests.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::DuplexStream,
    sync::{mpsc, watch},
};

use crate::{
    error::{TunnelError, TunnelResult},
    jump::{Credential, JumpHost},
    transport::{IncomingStream, RelayStream, RemoteListener, SshTransport, TransportSession},
};

#[derive(Default)]
pub(crate) struct FakeTransport {
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    reject: AtomicBool,
    fail_cancel: Arc<AtomicBool>,
    delay: Mutex<Duration>,
    refused_targets: Arc<Mutex<HashSet<String>>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn reject_credentials(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Cancelling a remote bind fails, leaving it registered
    pub(crate) fn fail_remote_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    /// Channels opened towards `host` fail
    pub(crate) fn refuse_target(&self, host: &str) {
        self.refused_targets.lock().unwrap().insert(host.to_string());
    }

    /// Simulate the jump host dropping every connection
    pub(crate) fn drop_sessions(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            session.closed.send_replace(true);
        }
    }

    /// Remote binds currently registered across all sessions
    pub(crate) fn remote_binds(&self) -> Vec<u16> {
        let sessions = self.sessions.lock().unwrap();
        let mut ports: Vec<u16> = sessions
            .iter()
            .flat_map(|s| s.remote.lock().unwrap().keys().copied().collect::<Vec<_>>())
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Act as a client connecting to a remote bind on the jump host
    pub(crate) async fn connect_remote(&self, port: u16) -> Option<DuplexStream> {
        let sender = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .find_map(|s| s.remote.lock().unwrap().get(&port).cloned())
        }?;
        let (client, server) = tokio::io::duplex(64 * 1024);
        sender
            .send(IncomingStream {
                stream: Box::new(server),
                originator: "203.0.113.7:50000".to_string(),
            })
            .await
            .ok()?;
        Some(client)
    }
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn connect(
        &self,
        jump: &JumpHost,
        _credential: &Credential,
        timeout: Duration,
    ) -> TunnelResult<Arc<dyn TransportSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TunnelError::Connect(format!("{} timed out", jump.host)));
        }
        tokio::time::sleep(delay).await;

        if self.reject.load(Ordering::SeqCst) {
            return Err(TunnelError::Authentication(format!(
                "{} rejected credentials",
                jump.host
            )));
        }

        let (closed, _) = watch::channel(false);
        let session = Arc::new(FakeSession {
            closed,
            disconnects: Arc::clone(&self.disconnects),
            fail_cancel: Arc::clone(&self.fail_cancel),
            refused_targets: Arc::clone(&self.refused_targets),
            remote: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

pub(crate) struct FakeSession {
    closed: watch::Sender<bool>,
    disconnects: Arc<AtomicUsize>,
    fail_cancel: Arc<AtomicBool>,
    refused_targets: Arc<Mutex<HashSet<String>>>,
    remote: Mutex<HashMap<u16, mpsc::Sender<IncomingStream>>>,
    next_port: AtomicU16,
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> TunnelResult<RelayStream> {
        if *self.closed.borrow() {
            return Err(TunnelError::transport("session closed"));
        }
        if self.refused_targets.lock().unwrap().contains(host) {
            return Err(TunnelError::transport(format!(
                "open failed for {host}:{port}"
            )));
        }

        // The far side echoes everything back
        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }

    async fn request_remote_forward(
        &self,
        _bind_address: &str,
        bind_port: u16,
    ) -> TunnelResult<RemoteListener> {
        let mut remote = self.remote.lock().unwrap();
        let bound_port = if bind_port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            bind_port
        };
        if remote.contains_key(&bound_port) {
            return Err(TunnelError::BindConflict(format!(
                "remote port {bound_port} in use"
            )));
        }
        let (tx, incoming) = mpsc::channel(8);
        remote.insert(bound_port, tx);
        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_remote_forward(&self, _bind_address: &str, bind_port: u16) -> TunnelResult<()> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(TunnelError::transport(format!(
                "cancel of remote port {bind_port} refused"
            )));
        }
        self.remote.lock().unwrap().remove(&bind_port);
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

/// A localhost port that was free a moment ago
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
