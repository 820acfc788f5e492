use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use russh::{
    Channel, Disconnect,
    client::{self, Handle, Msg},
    keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg},
};
use tokio::{
    sync::{RwLock, mpsc, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult},
    jump::{Credential, JumpHost},
    transport::{IncomingStream, RelayStream, RemoteListener, SshTransport, TransportSession},
};

/// Pending connections queued per remote bind before new ones are refused
const REMOTE_BACKLOG: usize = 32;

type RemoteForwards = Arc<Mutex<HashMap<u32, mpsc::Sender<IncomingStream>>>>;

/// Transport capability backed by russh
pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl RusshTransport {
    /// Create a transport with keepalives suited to long-lived tunnels
    pub fn new() -> Self {
        let mut config = client::Config::default();
        config.inactivity_timeout = None;
        config.keepalive_interval = Some(Duration::from_secs(30));
        config.keepalive_max = 3;
        config.nodelay = true;

        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn connect(
        &self,
        jump: &JumpHost,
        credential: &Credential,
        connect_timeout: Duration,
    ) -> TunnelResult<Arc<dyn TransportSession>> {
        // Key problems are reported before any network round trip
        let auth = AuthMaterial::from_credential(credential)?;

        let addr = format!("{}:{}", jump.host, jump.port);
        let remote_forwards: RemoteForwards = Arc::new(Mutex::new(HashMap::new()));
        let (alive_tx, alive_rx) = watch::channel(());

        let handler = JumpHandler {
            host: addr.clone(),
            fingerprint: jump.fingerprint.clone(),
            remote_forwards: Arc::clone(&remote_forwards),
            _alive: alive_tx,
        };

        info!("Connecting to jump host {}@{}", jump.user, addr);

        let establish = async {
            let mut handle = client::connect(Arc::clone(&self.config), addr.as_str(), handler).await?;
            authenticate(&mut handle, &jump.user, auth).await?;
            Ok::<_, TunnelError>(handle)
        };

        let handle = match timeout(connect_timeout, establish).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!("Session to {} failed: {}", addr, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Session to {} timed out", addr);
                return Err(TunnelError::Connect(format!(
                    "Connection to {addr} timed out after {:?}",
                    connect_timeout
                )));
            }
        };

        info!("Authenticated to jump host {}@{}", jump.user, addr);

        Ok(Arc::new(RusshSession {
            handle: RwLock::new(handle),
            remote_forwards,
            alive: alive_rx,
        }))
    }
}

enum AuthMaterial {
    Password(String),
    Key(PrivateKey),
}

impl AuthMaterial {
    fn from_credential(credential: &Credential) -> TunnelResult<Self> {
        match credential.load()? {
            Credential::Password(password) => Ok(AuthMaterial::Password(password)),
            Credential::PrivateKey { pem, passphrase } => {
                let key = russh::keys::decode_secret_key(&pem, passphrase.as_deref()).map_err(
                    |e| TunnelError::Authentication(format!("Failed to parse private key: {e}")),
                )?;
                Ok(AuthMaterial::Key(key))
            }
            Credential::KeyFile { path, .. } => Err(TunnelError::Authentication(format!(
                "Key file {} was not loaded",
                path.display()
            ))),
        }
    }
}

async fn authenticate(
    handle: &mut Handle<JumpHandler>,
    user: &str,
    auth: AuthMaterial,
) -> TunnelResult<()> {
    let result = match auth {
        AuthMaterial::Password(password) => {
            debug!("Attempting password authentication for user '{}'", user);
            handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| TunnelError::Authentication(e.to_string()))?
        }
        AuthMaterial::Key(key) => {
            debug!("Attempting key authentication for user '{}'", user);
            // RSA keys sign with rsa-sha2-* when the server allows it; other keys ignore the hash
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
            handle
                .authenticate_publickey(user, key)
                .await
                .map_err(|e| TunnelError::Authentication(e.to_string()))?
        }
    };

    if result.success() {
        Ok(())
    } else {
        Err(TunnelError::Authentication(format!(
            "Jump host rejected credentials for '{user}'"
        )))
    }
}

/// russh event handler for one jump host session
struct JumpHandler {
    host: String,
    fingerprint: Option<String>,
    remote_forwards: RemoteForwards,
    /// Dropped together with the session task, which wakes `closed()` waiters
    _alive: watch::Sender<()>,
}

impl client::Handler for JumpHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.fingerprint {
            Some(expected) if *expected != actual => {
                warn!(
                    "Host key mismatch for {}: expected {}, got {}",
                    self.host, expected, actual
                );
                Ok(false)
            }
            Some(_) => {
                debug!("Host key verified for {}", self.host);
                Ok(true)
            }
            None => {
                info!("Accepting host key {} for {}", actual, self.host);
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let sender = lock(&self.remote_forwards).get(&connected_port).cloned();
        let Some(sender) = sender else {
            warn!(
                "Jump host opened a channel for unknown bind {}:{}",
                connected_address, connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        let incoming = IncomingStream {
            stream: Box::new(channel.into_stream()),
            originator: format!("{originator_address}:{originator_port}"),
        };
        if sender.try_send(incoming).is_err() {
            warn!(
                "Dropping connection on {}:{}: listener busy or gone",
                connected_address, connected_port
            );
        }
        Ok(())
    }
}

struct RusshSession {
    /// Only `tcpip_forward` needs exclusive access; everything else shares the handle
    handle: RwLock<Handle<JumpHandler>>,
    remote_forwards: RemoteForwards,
    alive: watch::Receiver<()>,
}

#[async_trait]
impl TransportSession for RusshSession {
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> TunnelResult<RelayStream> {
        let channel = self
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(
                host,
                port.into(),
                originator.ip().to_string(),
                originator.port().into(),
            )
            .await
            .map_err(|e| TunnelError::transport(format!("Failed to open channel to {host}:{port}: {e}")))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> TunnelResult<RemoteListener> {
        let (tx, incoming) = mpsc::channel(REMOTE_BACKLOG);
        if bind_port != 0 {
            lock(&self.remote_forwards).insert(bind_port.into(), tx.clone());
        }

        let assigned = self
            .handle
            .write()
            .await
            .tcpip_forward(bind_address, bind_port.into())
            .await;

        let assigned = match assigned {
            Ok(port) => port,
            Err(e) => {
                lock(&self.remote_forwards).remove(&u32::from(bind_port));
                return Err(TunnelError::BindConflict(format!(
                    "Jump host refused to bind {bind_address}:{bind_port}: {e}"
                )));
            }
        };

        let bound_port = if bind_port == 0 {
            let port = u16::try_from(assigned).map_err(|_| {
                TunnelError::transport(format!("Jump host assigned invalid port {assigned}"))
            })?;
            lock(&self.remote_forwards).insert(assigned, tx);
            port
        } else {
            bind_port
        };

        debug!("Jump host listening on {}:{}", bind_address, bound_port);
        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_remote_forward(&self, bind_address: &str, bind_port: u16) -> TunnelResult<()> {
        lock(&self.remote_forwards).remove(&u32::from(bind_port));
        self.handle
            .read()
            .await
            .cancel_tcpip_forward(bind_address, bind_port.into())
            .await
            .map_err(|e| {
                TunnelError::transport(format!(
                    "Failed to cancel remote bind {bind_address}:{bind_port}: {e}"
                ))
            })
    }

    async fn closed(&self) {
        let mut alive = self.alive.clone();
        while alive.changed().await.is_ok() {}
    }

    async fn disconnect(&self) {
        let handle = self.handle.read().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Error while disconnecting: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
