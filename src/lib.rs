//! jumpgate - SSH tunnel supervisor
//!
//! Brings groups of SSH port forwards up and down together over one
//! authenticated jump host session per group, with per-forward state,
//! traffic counters and an ordered event stream.
//!
//! # Features
//!
//! - Local (`-L`) and remote (`-R`) forwarding over a shared russh session
//! - Reference-counted jump host sessions, torn down with their last forward
//! - Partial-failure isolation: one failing forward degrades its group
//! - Cross-group bind conflict detection
//! - Explicit restarts only, never silent reconnect loops
//! - Structured logging with tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use jumpgate::{
//!     Credential, ForwardSpec, ForwardingMode, JumpHost, RusshTransport, Supervisor,
//!     SupervisorOptions, TunnelGroup, TunnelStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let group = TunnelGroup::new("office", JumpHost::new("192.168.1.100", 22, "ops"))
//!         .with_forward(ForwardSpec::parse("8080:db.internal:5432", ForwardingMode::Local)?)
//!         .with_forward(ForwardSpec::parse("8081:web.internal:443", ForwardingMode::Local)?);
//!
//!     let store = Arc::new(TunnelStore::from_groups(vec![group])?);
//!     let supervisor = Supervisor::new(
//!         Arc::new(RusshTransport::new()),
//!         SupervisorOptions::default(),
//!         store,
//!     );
//!
//!     let credential = Credential::Password("secret".to_string());
//!     let status = supervisor.start_group("office", &credential).await?;
//!     println!("office is {:?}", status.state);
//!
//!     supervisor.stop_group("office").await?;
//!     Ok(())
//! }
//! ```

pub mod bind;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod forwarding;
pub mod jump;
pub mod session;
pub mod ssh;
pub mod store;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Config, ForwardConfig, GroupConfig, JumpHostConfig};
pub use controller::{ForwardController, ForwardStatus, TrafficStats};
pub use error::{ErrorKind, TunnelError, TunnelResult};
pub use event::{ErrorDetail, ForwardState, GroupState, TunnelEvent};
pub use forwarding::{ForwardSpec, ForwardingMode};
pub use jump::{Credential, JumpHost, JumpHostId};
pub use session::{SessionInfo, SessionManager};
pub use ssh::RusshTransport;
pub use store::{TunnelGroup, TunnelStore};
pub use supervisor::{GroupStatus, Supervisor, SupervisorOptions};
pub use transport::{SshTransport, TransportSession};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing.
///
/// `verbosity` raises the default level (0 = info, 1 = debug, 2+ = trace);
/// `RUST_LOG` takes precedence when set.
pub fn init_logging(verbosity: u8) -> TunnelResult<()> {
    let default = match verbosity {
        0 => "jumpgate=info",
        1 => "jumpgate=debug",
        _ => "jumpgate=trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TunnelError::Configuration(e.to_string()))?;

    Ok(())
}
