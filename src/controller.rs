//! Forward Controller: drives one forward through
//! idle → connecting → active → stopped/error.
//!
//! `start`/`stop` on one controller are serialized. `stop` cancels an
//! in-flight connect instead of waiting for it, including starts that are
//! still queued. Every accepted connection is relayed in its own task, so one
//! broken connection never affects the forward.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf, copy_bidirectional},
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    bind::{BindClaim, BindKey, BindRegistry, normalize_address},
    error::{TunnelError, TunnelResult},
    event::{ErrorDetail, EventBus, ForwardState, TunnelEvent},
    forwarding::{ForwardSpec, ForwardingMode},
    jump::{Credential, JumpHost},
    session::{SessionHandle, SessionManager},
    transport::{IncomingStream, RemoteListener, TransportSession},
};

/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything the forwards of one group share
pub struct ForwardContext {
    pub group: String,
    pub jump: JumpHost,
    pub sessions: Arc<SessionManager>,
    pub binds: Arc<BindRegistry>,
    pub events: EventBus,
    /// Limit for a single bind request and for dialing relay targets
    pub bind_timeout: Duration,
}

/// Outcome of a session being established on behalf of a whole group
pub type GroupSession = Option<Result<Arc<SessionHandle>, ErrorDetail>>;

/// Where a starting forward gets its session reference from
pub enum SessionSource<'a> {
    /// Acquire (or reuse) the jump host session with these credentials
    Acquire(&'a Credential),
    /// Wait for the group's session, then take an extra reference on it
    Group(watch::Receiver<GroupSession>),
}

/// Taken when a start is requested; any `stop` requested later cancels it
pub struct StartTicket(watch::Receiver<u64>);

/// Traffic counters of a forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_failed: u64,
    /// Bytes relayed towards the jump host
    pub bytes_sent: u64,
    /// Bytes relayed from the jump host
    pub bytes_received: u64,
}

/// Snapshot returned by [`ForwardController::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ForwardStatus {
    pub group: String,
    pub forward: String,
    pub label: String,
    pub state: ForwardState,
    pub last_error: Option<ErrorDetail>,
    /// Address actually bound while active
    pub bound: Option<String>,
    pub traffic: TrafficStats,
}

pub struct ForwardController {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    spec: ForwardSpec,
    ctx: Arc<ForwardContext>,
    cell: Mutex<StateCell>,
    counters: Counters,
    /// Serializes start/stop
    op: tokio::sync::Mutex<()>,
    /// Bumped by every stop request
    stops: watch::Sender<u64>,
    running: Mutex<Option<Running>>,
}

struct StateCell {
    state: ForwardState,
    last_error: Option<ErrorDetail>,
    bound: Option<String>,
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Option<TunnelError>>,
    session: Arc<SessionHandle>,
}

struct Established {
    session: SessionHandle,
    binding: Binding,
    claim: BindClaim,
}

impl ForwardController {
    pub fn new(spec: ForwardSpec, ctx: Arc<ForwardContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: spec.id(),
                spec,
                ctx,
                cell: Mutex::new(StateCell {
                    state: ForwardState::Idle,
                    last_error: None,
                    bound: None,
                }),
                counters: Counters::default(),
                op: tokio::sync::Mutex::new(()),
                stops: watch::Sender::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ForwardState {
        self.inner.cell().state
    }

    /// Start this forward, acquiring the jump host session itself.
    ///
    /// Returns the state the forward settled in; failures are reported as
    /// `Error` state plus an event rather than returned.
    pub async fn start(&self, credential: &Credential) -> ForwardState {
        let ticket = self.ticket();
        self.start_with(SessionSource::Acquire(credential), ticket).await
    }

    pub fn ticket(&self) -> StartTicket {
        StartTicket(self.inner.stops.subscribe())
    }

    /// Cancel any start requested so far without waiting for it
    pub fn request_stop(&self) {
        self.inner.stops.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Start this forward. No-op while connecting or active, or when a stop
    /// was requested after `ticket` was taken.
    pub async fn start_with(&self, source: SessionSource<'_>, ticket: StartTicket) -> ForwardState {
        let inner = &self.inner;
        let StartTicket(mut stops) = ticket;
        let _op = inner.op.lock().await;

        let current = inner.state();
        if stops.has_changed().unwrap_or(true) {
            debug!("Forward {}: start withdrawn", inner.id);
            return current;
        }
        if current.holds_session() {
            debug!("Forward {} already {:?}", inner.id, current);
            return current;
        }
        inner.reap().await;

        inner.transition(ForwardState::Connecting, None);

        let outcome = tokio::select! {
            biased;
            _ = stops.changed() => None,
            res = inner.establish(source) => Some(res),
        };

        match outcome {
            None => {
                info!("Forward {} cancelled while connecting", inner.id);
                inner.transition(ForwardState::Stopped, None);
            }
            Some(Err(e)) => {
                inner.transition(ForwardState::Error, Some(&e));
            }
            Some(Ok(established)) => inner.activate(established),
        }

        inner.state()
    }

    /// Fail a forward that could not be started, e.g. because the group's
    /// session could not be established.
    pub async fn reject(&self, err: &TunnelError) -> ForwardState {
        let _op = self.inner.op.lock().await;
        let current = self.inner.state();
        if current.holds_session() {
            return current;
        }
        self.inner.reap().await;
        self.inner.transition(ForwardState::Connecting, None);
        self.inner.transition(ForwardState::Error, Some(err));
        self.inner.state()
    }

    /// Stop this forward. Releases its session reference unconditionally;
    /// a listener that fails to close is reported on the event but not returned.
    pub async fn stop(&self) -> ForwardState {
        self.request_stop();

        let _op = self.inner.op.lock().await;
        let close_error = self.inner.reap().await;
        if self.inner.state() == ForwardState::Active {
            self.inner.transition(ForwardState::Stopped, close_error.as_ref());
        }
        self.inner.state()
    }

    pub fn status(&self) -> ForwardStatus {
        let cell = self.inner.cell();
        ForwardStatus {
            group: self.inner.ctx.group.clone(),
            forward: self.inner.id.clone(),
            label: self.inner.spec.label.clone(),
            state: cell.state,
            last_error: cell.last_error.clone(),
            bound: cell.bound.clone(),
            traffic: self.inner.counters.snapshot(),
        }
    }
}

impl Drop for ForwardController {
    fn drop(&mut self) {
        self.request_stop();
        // The serve task releases the session and bind on its way out
        if let Some(running) = lock(&self.inner.running).take() {
            let _ = running.stop.send(());
        }
    }
}

impl Inner {
    fn cell(&self) -> MutexGuard<'_, StateCell> {
        lock(&self.cell)
    }

    fn state(&self) -> ForwardState {
        self.cell().state
    }

    fn owner(&self) -> String {
        format!("{}/{}", self.ctx.group, self.id)
    }

    /// Apply a state change and publish it. Invalid transitions are ignored.
    fn transition(&self, next: ForwardState, error: Option<&TunnelError>) -> bool {
        let mut cell = self.cell();
        let prev = cell.state;
        if !prev.can_transition_to(next) {
            debug!("Forward {}: ignoring {:?} -> {:?}", self.id, prev, next);
            return false;
        }

        cell.state = next;
        let detail = error.map(ErrorDetail::from);
        if detail.is_some() {
            cell.last_error = detail.clone();
        } else if next == ForwardState::Connecting {
            cell.last_error = None;
        }
        if !next.holds_session() {
            cell.bound = None;
        }

        match &detail {
            Some(d) if next == ForwardState::Error => {
                warn!("[{}] {} failed: {}", self.ctx.group, self.id, d)
            }
            Some(d) => warn!("[{}] {} {:?} with error: {}", self.ctx.group, self.id, next, d),
            None => info!("[{}] {} {:?} -> {:?}", self.ctx.group, self.id, prev, next),
        }

        // Published under the state lock so events of one forward stay ordered
        self.ctx.events.publish(TunnelEvent {
            timestamp: Utc::now(),
            group: self.ctx.group.clone(),
            forward: self.id.clone(),
            old_state: prev,
            new_state: next,
            error: detail,
        });
        true
    }

    async fn establish(&self, source: SessionSource<'_>) -> TunnelResult<Established> {
        self.spec.validate()?;
        let claim = self
            .ctx
            .binds
            .claim(BindKey::for_forward(&self.spec, &self.ctx.jump), &self.owner())?;

        let session = match source {
            SessionSource::Acquire(credential) => {
                self.ctx.sessions.acquire(&self.ctx.jump, credential).await?
            }
            SessionSource::Group(mut pending) => {
                let shared = pending
                    .wait_for(Option::is_some)
                    .await
                    .map(|shared| shared.clone())
                    .map_err(|_| TunnelError::transport("Group start was abandoned"))?;
                match shared {
                    Some(Ok(handle)) => self.ctx.sessions.retain(&handle).await?,
                    Some(Err(detail)) => return Err(TunnelError::from(&detail)),
                    None => return Err(TunnelError::transport("Group start was abandoned")),
                }
            }
        };

        match self.bind(&session).await {
            Ok(binding) => Ok(Established {
                session,
                binding,
                claim,
            }),
            Err(e) => {
                session.release().await;
                Err(e)
            }
        }
    }

    async fn bind(&self, session: &SessionHandle) -> TunnelResult<Binding> {
        let port = self.spec.bind_port;
        let limit = self.ctx.bind_timeout;

        match self.spec.mode {
            ForwardingMode::Local => {
                // `*` and empty mean every interface, as for OpenSSH
                let address = normalize_address(self.spec.effective_bind_address());
                let listener = timeout(limit, TcpListener::bind((address.as_str(), port)))
                    .await
                    .map_err(|_| {
                        TunnelError::transport(format!("Binding {address}:{port} timed out"))
                    })?
                    .map_err(|e| bind_error(&address, port, e))?;
                Ok(Binding::Local(listener))
            }
            ForwardingMode::Remote => {
                let address = self.spec.effective_bind_address().to_string();
                let listener = timeout(
                    limit,
                    session.transport().request_remote_forward(&address, port),
                )
                .await
                .map_err(|_| {
                    TunnelError::transport(format!(
                        "Remote bind {address}:{port} on {} timed out",
                        self.ctx.jump.host
                    ))
                })??;
                Ok(Binding::Remote { address, listener })
            }
        }
    }

    fn activate(self: &Arc<Self>, established: Established) {
        let Established {
            session,
            binding,
            claim,
        } = established;

        self.cell().bound = Some(binding.describe(&self.ctx.jump));
        self.transition(ForwardState::Active, None);

        let session = Arc::new(session);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(serve(
            Arc::clone(self),
            binding,
            Arc::clone(&session),
            claim,
            stop_rx,
        ));

        *lock(&self.running) = Some(Running {
            stop: stop_tx,
            task,
            session,
        });
    }

    /// Stop the serve task of the previous cycle, if any, and return the
    /// error from closing its listener.
    async fn reap(&self) -> Option<TunnelError> {
        let running = lock(&self.running).take()?;
        let _ = running.stop.send(());
        let close_error = match running.task.await {
            Ok(close_error) => close_error,
            Err(e) => {
                warn!("Forward {} task ended abnormally: {}", self.id, e);
                None
            }
        };
        running.session.release().await;
        close_error
    }
}

fn bind_error(address: &str, port: u16, err: std::io::Error) -> TunnelError {
    if err.kind() == std::io::ErrorKind::AddrInUse {
        TunnelError::BindConflict(format!("{address}:{port} is already in use"))
    } else {
        TunnelError::transport(format!("Failed to bind {address}:{port}: {err}"))
    }
}

enum Binding {
    Local(TcpListener),
    Remote {
        address: String,
        listener: RemoteListener,
    },
}

enum Accepted {
    Local(TcpStream, SocketAddr),
    Remote(IncomingStream),
    Failed(std::io::Error),
    Closed,
}

impl Binding {
    async fn accept(&mut self) -> Accepted {
        match self {
            Binding::Local(listener) => match listener.accept().await {
                Ok((stream, peer)) => Accepted::Local(stream, peer),
                Err(e) => Accepted::Failed(e),
            },
            Binding::Remote { listener, .. } => match listener.incoming.recv().await {
                Some(incoming) => Accepted::Remote(incoming),
                None => Accepted::Closed,
            },
        }
    }

    fn describe(&self, jump: &JumpHost) -> String {
        match self {
            Binding::Local(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            Binding::Remote { address, listener } => {
                format!("{}:{} on {}", address, listener.bound_port, jump.host)
            }
        }
    }

    async fn close(
        self,
        transport: &Arc<dyn TransportSession>,
        limit: Duration,
    ) -> Option<TunnelError> {
        match self {
            Binding::Local(listener) => {
                drop(listener);
                None
            }
            Binding::Remote { address, listener } => {
                let port = listener.bound_port;
                drop(listener);
                match timeout(limit, transport.cancel_remote_forward(&address, port)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(TunnelError::transport(format!(
                        "Cancelling remote bind {address}:{port} timed out"
                    ))),
                }
            }
        }
    }
}

/// Accept loop of an active forward. Returns the error from closing the
/// listener when stopped on request.
async fn serve(
    inner: Arc<Inner>,
    mut binding: Binding,
    session: Arc<SessionHandle>,
    claim: BindClaim,
    mut stop: oneshot::Receiver<()>,
) -> Option<TunnelError> {
    let transport = Arc::clone(session.transport());
    let mut lost = session.lost();
    let mut relays = JoinSet::new();

    let lost_reason = loop {
        tokio::select! {
            _ = &mut stop => break None,
            reason = wait_lost(&mut lost) => break Some(reason),
            accepted = binding.accept() => match accepted {
                Accepted::Local(stream, peer) => {
                    relays.spawn(relay_local(Arc::clone(&inner), Arc::clone(&transport), stream, peer));
                }
                Accepted::Remote(incoming) => {
                    relays.spawn(relay_remote(Arc::clone(&inner), incoming));
                }
                Accepted::Failed(e) => {
                    warn!("Forward {}: accept failed: {}", inner.id, e);
                    sleep(ACCEPT_BACKOFF).await;
                }
                Accepted::Closed => {
                    break Some(format!("Jump host closed the listener of {}", inner.id));
                }
            },
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    };

    relays.shutdown().await;
    let close_error = binding.close(&transport, inner.ctx.bind_timeout).await;
    if let Some(e) = &close_error {
        warn!("Forward {}: listener did not close cleanly: {}", inner.id, e);
    }
    session.release().await;
    drop(claim);

    match lost_reason {
        Some(reason) => {
            inner.transition(ForwardState::Error, Some(&TunnelError::Transport(reason)));
            None
        }
        None => close_error,
    }
}

async fn wait_lost(lost: &mut watch::Receiver<Option<String>>) -> String {
    match lost.wait_for(|reason| reason.is_some()).await {
        Ok(reason) => reason.clone().unwrap_or_default(),
        Err(_) => "session dropped".to_string(),
    }
}

async fn relay_local(
    inner: Arc<Inner>,
    transport: Arc<dyn TransportSession>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _active = inner.counters.open();
    let spec = &inner.spec;

    let mut remote = match transport
        .open_direct(&spec.target_host, spec.target_port, peer)
        .await
    {
        Ok(remote) => remote,
        Err(e) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Forward {}: connection from {} not relayed: {}", inner.id, peer, e);
            return;
        }
    };

    let mut client = Metered::new(stream, &inner.counters);
    match copy_bidirectional(&mut client, &mut remote).await {
        Ok((sent, received)) => {
            debug!(
                "Forward {}: connection from {} closed ({} bytes out, {} bytes in)",
                inner.id, peer, sent, received
            );
        }
        Err(e) => debug!("Forward {}: connection from {} ended: {}", inner.id, peer, e),
    }
}

async fn relay_remote(inner: Arc<Inner>, incoming: IncomingStream) {
    let _active = inner.counters.open();
    let spec = &inner.spec;
    let target = (spec.target_host.as_str(), spec.target_port);

    let local = match timeout(inner.ctx.bind_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Forward {}: cannot reach {}:{}: {}",
                inner.id, spec.target_host, spec.target_port, e
            );
            return;
        }
        Err(_) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Forward {}: connecting to {}:{} timed out",
                inner.id, spec.target_host, spec.target_port
            );
            return;
        }
    };

    let mut remote = incoming.stream;
    let mut local = Metered::new(local, &inner.counters);
    match copy_bidirectional(&mut remote, &mut local).await {
        Ok((received, sent)) => {
            debug!(
                "Forward {}: connection from {} closed ({} bytes out, {} bytes in)",
                inner.id, incoming.originator, sent, received
            );
        }
        Err(e) => debug!(
            "Forward {}: connection from {} ended: {}",
            inner.id, incoming.originator, e
        ),
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Counters {
    fn open(&self) -> ActiveConnection<'_> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection(self)
    }

    fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            connections_active: self.active.load(Ordering::Relaxed),
            connections_failed: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.sent.load(Ordering::Relaxed),
            bytes_received: self.received.load(Ordering::Relaxed),
        }
    }
}

struct ActiveConnection<'a>(&'a Counters);

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Local end of a relayed connection. Bytes read from it travel towards the
/// jump host, bytes written to it came back; both are counted as they pass.
struct Metered<'a, S> {
    io: S,
    counters: &'a Counters,
}

impl<'a, S> Metered<'a, S> {
    fn new(io: S, counters: &'a Counters) -> Self {
        Self { io, counters }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.io).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = (buf.filled().len() - before) as u64;
            this.counters.sent.fetch_add(read, Ordering::Relaxed);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.io).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll {
            this.counters.received.fetch_add(written as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
