//! Tunnel Definition Store.
//!
//! Plain in-memory definitions edited by the presentation layer. The
//! supervisor reads a snapshot whenever it acts and never writes back.

use std::sync::{
    RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bind::BindKey,
    error::{TunnelError, TunnelResult},
    forwarding::ForwardSpec,
    jump::JumpHost,
};

/// One jump host and the forwards that traverse it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelGroup {
    pub name: String,
    pub jump: JumpHost,
    pub forwards: Vec<ForwardSpec>,
}

impl TunnelGroup {
    pub fn new(name: impl Into<String>, jump: JumpHost) -> Self {
        Self {
            name: name.into(),
            jump,
            forwards: Vec::new(),
        }
    }

    pub fn with_forward(mut self, spec: ForwardSpec) -> Self {
        self.forwards.push(spec);
        self
    }

    /// Look up a forward by its id (`-L 8080:db:5432`)
    pub fn forward(&self, id: &str) -> Option<&ForwardSpec> {
        self.forwards.iter().find(|f| f.id() == id)
    }

    /// Full validation: jump host, every forward, and bind uniqueness within the group
    pub fn validate(&self) -> TunnelResult<()> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::config("Group name cannot be empty"));
        }
        self.jump.validate()?;
        if self.forwards.is_empty() {
            return Err(TunnelError::config(format!(
                "Group {} has no forwards",
                self.name
            )));
        }

        let mut seen: Vec<BindKey> = Vec::with_capacity(self.forwards.len());
        for spec in &self.forwards {
            spec.validate()?;
            let key = BindKey::for_forward(spec, &self.jump);
            if seen.iter().any(|k| k.conflicts_with(&key)) {
                return Err(TunnelError::config(format!(
                    "Group {} binds {} more than once",
                    self.name, key
                )));
            }
            seen.push(key);
        }
        Ok(())
    }
}

/// Ordered collection of group definitions
#[derive(Debug, Default)]
pub struct TunnelStore {
    groups: RwLock<Vec<TunnelGroup>>,
    revision: AtomicU64,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from definitions, rejecting duplicate names
    pub fn from_groups(groups: Vec<TunnelGroup>) -> TunnelResult<Self> {
        let store = Self::new();
        store.replace(groups)?;
        Ok(store)
    }

    /// Bumped on every successful change
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn create(&self, group: TunnelGroup) -> TunnelResult<()> {
        check_name(&group.name)?;
        let mut groups = self.write();
        if groups.iter().any(|g| g.name == group.name) {
            return Err(TunnelError::config(format!(
                "Group {} already exists",
                group.name
            )));
        }
        debug!("Created group {}", group.name);
        groups.push(group);
        self.bump();
        Ok(())
    }

    /// Replace the definition of an existing group
    pub fn update(&self, group: TunnelGroup) -> TunnelResult<()> {
        let mut groups = self.write();
        let slot = groups
            .iter_mut()
            .find(|g| g.name == group.name)
            .ok_or_else(|| unknown_group(&group.name))?;
        *slot = group;
        self.bump();
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Option<TunnelGroup> {
        let mut groups = self.write();
        let index = groups.iter().position(|g| g.name == name)?;
        let removed = groups.remove(index);
        self.bump();
        Some(removed)
    }

    pub fn add_forward(&self, group: &str, spec: ForwardSpec) -> TunnelResult<()> {
        let mut groups = self.write();
        let target = groups
            .iter_mut()
            .find(|g| g.name == group)
            .ok_or_else(|| unknown_group(group))?;
        if target.forward(&spec.id()).is_some() {
            return Err(TunnelError::config(format!(
                "Forward {} already exists in group {}",
                spec.id(),
                group
            )));
        }
        target.forwards.push(spec);
        self.bump();
        Ok(())
    }

    pub fn remove_forward(&self, group: &str, forward: &str) -> TunnelResult<ForwardSpec> {
        let mut groups = self.write();
        let target = groups
            .iter_mut()
            .find(|g| g.name == group)
            .ok_or_else(|| unknown_group(group))?;
        let index = target
            .forwards
            .iter()
            .position(|f| f.id() == forward)
            .ok_or_else(|| {
                TunnelError::config(format!("Group {group} has no forward {forward}"))
            })?;
        let removed = target.forwards.remove(index);
        self.bump();
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<TunnelGroup> {
        self.read().iter().find(|g| g.name == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|g| g.name.clone()).collect()
    }

    /// Copy of every definition, in insertion order
    pub fn snapshot(&self) -> Vec<TunnelGroup> {
        self.read().clone()
    }

    /// Swap in a whole new set of definitions
    pub fn replace(&self, groups: Vec<TunnelGroup>) -> TunnelResult<()> {
        for (i, group) in groups.iter().enumerate() {
            check_name(&group.name)?;
            if groups[..i].iter().any(|g| g.name == group.name) {
                return Err(TunnelError::config(format!(
                    "Duplicate group name {}",
                    group.name
                )));
            }
        }
        *self.write() = groups;
        self.bump();
        Ok(())
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<TunnelGroup>> {
        self.groups.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<TunnelGroup>> {
        self.groups.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn check_name(name: &str) -> TunnelResult<()> {
    if name.trim().is_empty() {
        return Err(TunnelError::config("Group name cannot be empty"));
    }
    Ok(())
}

pub(crate) fn unknown_group(name: &str) -> TunnelError {
    TunnelError::config(format!("Unknown group {name}"))
}
