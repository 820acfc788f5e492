//! Bind claims shared by every group of a supervisor.
//!
//! A forward holds a [`BindClaim`] for as long as it is connecting or active;
//! dropping the claim frees the address for other forwards.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::{ForwardSpec, ForwardingMode},
    jump::{JumpHost, JumpHostId},
};

/// Which machine a bind happens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindSite {
    Local,
    Remote(JumpHostId),
}

/// Normalized bind address and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindKey {
    pub site: BindSite,
    pub address: String,
    pub port: u16,
}

impl BindKey {
    pub fn for_forward(spec: &ForwardSpec, jump: &JumpHost) -> Self {
        let site = match spec.mode {
            ForwardingMode::Local => BindSite::Local,
            ForwardingMode::Remote => BindSite::Remote(jump.id()),
        };
        Self {
            site,
            address: normalize_address(spec.effective_bind_address()),
            port: spec.bind_port,
        }
    }

    fn is_wildcard(&self) -> bool {
        self.address == "0.0.0.0" || self.address == "::"
    }

    /// Two binds collide on the same site and port when either listens on all addresses
    pub fn conflicts_with(&self, other: &BindKey) -> bool {
        self.site == other.site
            && self.port != 0
            && self.port == other.port
            && (self.address == other.address || self.is_wildcard() || other.is_wildcard())
    }
}

impl std::fmt::Display for BindKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.site {
            BindSite::Local => write!(f, "{}:{}", self.address, self.port),
            BindSite::Remote(jump) => write!(f, "{}:{} on {}", self.address, self.port, jump),
        }
    }
}

pub(crate) fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_start_matches('[').trim_end_matches(']');
    match address.to_ascii_lowercase().as_str() {
        "" | "*" | "0.0.0.0" => "0.0.0.0".to_string(),
        "localhost" => "127.0.0.1".to_string(),
        "::" => "::".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
struct Claim {
    key: BindKey,
    owner: String,
}

/// Claimed binds across all groups
#[derive(Debug, Default)]
pub struct BindRegistry {
    claims: Mutex<HashMap<u64, Claim>>,
    next_id: AtomicU64,
}

impl BindRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `key` for `owner`, failing if another live claim collides with it
    pub fn claim(self: &Arc<Self>, key: BindKey, owner: &str) -> TunnelResult<BindClaim> {
        let mut claims = self.lock();
        if let Some(existing) = claims.values().find(|c| c.key.conflicts_with(&key)) {
            return Err(TunnelError::BindConflict(format!(
                "{} is already claimed by {}",
                key, existing.owner
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Bind {} claimed by {}", key, owner);
        claims.insert(
            id,
            Claim {
                key,
                owner: owner.to_string(),
            },
        );

        Ok(BindClaim {
            registry: Arc::clone(self),
            id,
        })
    }

    /// Owner of a live claim colliding with `key`, without claiming anything
    pub fn conflict(&self, key: &BindKey) -> Option<String> {
        self.lock()
            .values()
            .find(|c| c.key.conflicts_with(key))
            .map(|c| c.owner.clone())
    }

    /// Number of live claims
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: u64) {
        if let Some(claim) = self.lock().remove(&id) {
            debug!("Bind {} released by {}", claim.key, claim.owner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Claim>> {
        self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held while a forward owns its bind address
#[derive(Debug)]
pub struct BindClaim {
    registry: Arc<BindRegistry>,
    id: u64,
}

impl Drop for BindClaim {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(spec: &str, mode: ForwardingMode, jump: &JumpHost) -> BindKey {
        BindKey::for_forward(&ForwardSpec::parse(spec, mode).unwrap(), jump)
    }

    #[test]
    fn test_conflict_rules() {
        let jump = JumpHost::new("bastion", 22, "ops");
        let a = key("8080:web:80", ForwardingMode::Local, &jump);
        let b = key("localhost:8080:api:80", ForwardingMode::Local, &jump);
        let wildcard = key("0.0.0.0:8080:api:80", ForwardingMode::Local, &jump);
        let other_ip = key("10.0.0.5:8080:api:80", ForwardingMode::Local, &jump);
        let remote = key("8080:web:80", ForwardingMode::Remote, &jump);

        assert!(a.conflicts_with(&b));
        assert!(wildcard.conflicts_with(&other_ip));
        assert!(!a.conflicts_with(&other_ip));
        assert!(!a.conflicts_with(&remote));
    }

    #[test]
    fn test_ephemeral_ports_never_conflict() {
        let jump = JumpHost::new("bastion", 22, "ops");
        let a = key("0:web:80", ForwardingMode::Local, &jump);
        let b = key("0:api:80", ForwardingMode::Local, &jump);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_claim_released_on_drop() {
        let jump = JumpHost::new("bastion", 22, "ops");
        let registry = BindRegistry::new();

        let claim = registry
            .claim(key("8080:web:80", ForwardingMode::Local, &jump), "g1/web")
            .unwrap();
        let err = registry
            .claim(key("8080:api:80", ForwardingMode::Local, &jump), "g2/api")
            .unwrap_err();
        assert!(matches!(err, TunnelError::BindConflict(_)));
        assert!(err.to_string().contains("g1/web"));

        assert_eq!(
            registry.conflict(&key("8080:api:80", ForwardingMode::Local, &jump)),
            Some("g1/web".to_string())
        );

        drop(claim);
        assert!(registry.is_empty());
        assert!(
            registry
                .claim(key("8080:api:80", ForwardingMode::Local, &jump), "g2/api")
                .is_ok()
        );
    }
}
