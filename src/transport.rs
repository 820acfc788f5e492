//! SSH transport capability.
//!
//! The supervisor never speaks SSH itself: it drives these traits, which the
//! russh-backed [`crate::ssh::RusshTransport`] implements for real jump hosts.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::{
    error::TunnelResult,
    jump::{Credential, JumpHost},
};

/// Byte stream relayed between a local socket and the jump host
pub trait RelayIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RelayIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type RelayStream = Box<dyn RelayIo>;

/// A connection the jump host accepted on a remote bind
pub struct IncomingStream {
    pub stream: RelayStream,
    /// Peer as reported by the jump host
    pub originator: String,
}

/// Remote-bind registration returned by [`TransportSession::request_remote_forward`]
pub struct RemoteListener {
    /// Port the jump host actually bound
    pub bound_port: u16,
    pub incoming: mpsc::Receiver<IncomingStream>,
}

/// Establishes authenticated sessions to jump hosts
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn connect(
        &self,
        jump: &JumpHost,
        credential: &Credential,
        timeout: Duration,
    ) -> TunnelResult<Arc<dyn TransportSession>>;
}

/// One authenticated transport to a jump host
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open a channel to `host:port` on behalf of a local peer
    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> TunnelResult<RelayStream>;

    /// Ask the jump host to listen on `bind_address:bind_port`
    async fn request_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> TunnelResult<RemoteListener>;

    async fn cancel_remote_forward(&self, bind_address: &str, bind_port: u16) -> TunnelResult<()>;

    /// Resolves once the transport is gone, for whatever reason
    async fn closed(&self);

    /// Close the transport
    async fn disconnect(&self);
}
