//! Supervisor: group-level orchestration of forward controllers.
//!
//! Each group has its own operation lock so start/stop of one group never
//! waits on another. A stop is signalled before it queues on that lock, so it
//! cuts short a start that is still connecting. Failures are captured per
//! forward and reported through the event stream; nothing here retries on
//! its own.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{broadcast, watch},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    bind::{BindKey, BindRegistry},
    controller::{ForwardContext, ForwardController, ForwardStatus, SessionSource},
    error::{TunnelError, TunnelResult},
    event::{ErrorDetail, EventBus, ForwardState, GroupState, TunnelEvent},
    forwarding::ForwardSpec,
    jump::Credential,
    session::{SessionInfo, SessionManager},
    store::{TunnelGroup, TunnelStore, unknown_group},
    transport::SshTransport,
};

/// Timeouts and buffer sizes of a supervisor
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Limit for establishing and authenticating a jump host session
    pub connect_timeout: Duration,
    /// Limit for a single bind request
    pub bind_timeout: Duration,
    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            bind_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

/// Aggregate view of one group
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub state: GroupState,
    pub forwards: Vec<ForwardStatus>,
    /// The jump host session, while one exists
    pub session: Option<SessionInfo>,
}

pub struct Supervisor {
    store: Arc<TunnelStore>,
    sessions: Arc<SessionManager>,
    binds: Arc<BindRegistry>,
    events: EventBus,
    options: SupervisorOptions,
    groups: Mutex<HashMap<String, Arc<GroupRuntime>>>,
}

struct GroupRuntime {
    name: String,
    /// Serializes group-level operations
    op: tokio::sync::Mutex<()>,
    /// Bumped by every group stop request
    stops: watch::Sender<u64>,
    members: Mutex<Members>,
}

impl GroupRuntime {
    fn request_stop(&self) {
        self.stops.send_modify(|n| *n = n.wrapping_add(1));
    }
}

struct Members {
    definition: TunnelGroup,
    controllers: Vec<Arc<ForwardController>>,
}

impl Members {
    fn is_running(&self) -> bool {
        self.controllers.iter().any(|c| c.state().holds_session())
    }
}

impl Supervisor {
    pub fn new(
        transport: Arc<dyn SshTransport>,
        options: SupervisorOptions,
        store: Arc<TunnelStore>,
    ) -> Self {
        Self {
            store,
            sessions: Arc::new(SessionManager::new(transport, options.connect_timeout)),
            binds: BindRegistry::new(),
            events: EventBus::new(options.event_capacity),
            options,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TunnelStore> {
        &self.store
    }

    /// Merged event stream of every forward in every group
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Live jump host sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.sessions()
    }

    /// Start every forward of `name` over one shared session.
    ///
    /// Only an unknown group is an error; forward failures end up in the
    /// returned status and on the event stream.
    pub async fn start_group(&self, name: &str, credential: &Credential) -> TunnelResult<GroupStatus> {
        let runtime = self.runtime(name)?;
        let stops = runtime.stops.subscribe();
        let _op = runtime.op.lock().await;
        self.start_locked(&runtime, credential, stops).await;
        Ok(self.status_of(&runtime))
    }

    /// Stop every forward of `name`, cancelling a start still in progress
    pub async fn stop_group(&self, name: &str) -> TunnelResult<GroupStatus> {
        let runtime = self.runtime(name)?;
        runtime.request_stop();
        let _op = runtime.op.lock().await;
        self.stop_locked(&runtime).await;
        Ok(self.status_of(&runtime))
    }

    /// Stop then start, picking up any definition change made in between
    pub async fn restart_group(&self, name: &str, credential: &Credential) -> TunnelResult<GroupStatus> {
        let runtime = self.runtime(name)?;
        runtime.request_stop();
        let _op = runtime.op.lock().await;
        self.stop_locked(&runtime).await;
        let stops = runtime.stops.subscribe();
        self.start_locked(&runtime, credential, stops).await;
        Ok(self.status_of(&runtime))
    }

    /// Current status of a group. Never waits on running operations.
    pub fn status_group(&self, name: &str) -> TunnelResult<GroupStatus> {
        let runtime = self.runtime(name)?;
        Ok(self.status_of(&runtime))
    }

    /// Status of every defined group, plus running groups no longer defined
    pub fn status_all(&self) -> Vec<GroupStatus> {
        let mut names = self.store.names();
        let mut orphaned: Vec<String> = self
            .lock_groups()
            .keys()
            .filter(|name| !names.contains(*name))
            .cloned()
            .collect();
        orphaned.sort();
        names.extend(orphaned);

        names
            .iter()
            .filter_map(|name| self.status_group(name).ok())
            .collect()
    }

    /// Start a single forward of a group with its own session reference
    pub async fn start_forward(
        &self,
        group: &str,
        forward: &str,
        credential: &Credential,
    ) -> TunnelResult<ForwardStatus> {
        let runtime = self.runtime(group)?;
        let _op = runtime.op.lock().await;
        self.refresh(&runtime);

        let (controller, definition) = {
            let members = lock(&runtime.members);
            (find(&members, forward)?, members.definition.clone())
        };

        if let Err(e) = definition.jump.validate() {
            controller.reject(&e).await;
        } else if let Some(err) = self.preflight(&definition, controller.spec(), &[]) {
            controller.reject(&err).await;
        } else {
            controller.start(credential).await;
        }
        Ok(controller.status())
    }

    pub async fn stop_forward(&self, group: &str, forward: &str) -> TunnelResult<ForwardStatus> {
        let runtime = self.runtime(group)?;
        find(&lock(&runtime.members), forward)?.request_stop();
        let _op = runtime.op.lock().await;
        let controller = find(&lock(&runtime.members), forward)?;
        controller.stop().await;
        Ok(controller.status())
    }

    /// Replace the store contents with a new snapshot.
    ///
    /// Running groups keep serving their current definition until restarted;
    /// the names of those whose definition changed are returned.
    pub fn reload(&self, groups: Vec<TunnelGroup>) -> TunnelResult<Vec<String>> {
        self.store.replace(groups)?;

        let mut changed = Vec::new();
        let mut runtimes = self.lock_groups();
        runtimes.retain(|name, runtime| {
            let members = lock(&runtime.members);
            let fresh = self.store.get(name);
            let running = members.is_running();
            if running && fresh.as_ref() != Some(&members.definition) {
                changed.push(name.clone());
            }
            running || fresh.is_some()
        });
        drop(runtimes);

        changed.sort();
        info!(
            "Reloaded {} group(s), {} running group(s) need a restart",
            self.store.names().len(),
            changed.len()
        );
        Ok(changed)
    }

    /// Stop every group
    pub async fn shutdown(&self) {
        let runtimes: Vec<Arc<GroupRuntime>> = self.lock_groups().values().cloned().collect();
        info!("Shutting down {} group(s)", runtimes.len());

        let mut stops = JoinSet::new();
        for runtime in runtimes {
            runtime.request_stop();
            stops.spawn(async move {
                let _op = runtime.op.lock().await;
                let controllers = lock(&runtime.members).controllers.clone();
                stop_all(controllers).await;
            });
        }
        while let Some(res) = stops.join_next().await {
            if let Err(e) = res {
                warn!("Group shutdown task failed: {}", e);
            }
        }
    }

    async fn start_locked(
        &self,
        runtime: &GroupRuntime,
        credential: &Credential,
        mut stops: watch::Receiver<u64>,
    ) {
        if stops.has_changed().unwrap_or(true) {
            debug!("Group {}: start withdrawn by a later stop", runtime.name);
            return;
        }
        self.refresh(runtime);
        let (definition, controllers) = {
            let members = lock(&runtime.members);
            (members.definition.clone(), members.controllers.clone())
        };
        let pending: Vec<Arc<ForwardController>> = controllers
            .into_iter()
            .filter(|c| !c.state().holds_session())
            .collect();
        if pending.is_empty() {
            debug!("Group {} already running", runtime.name);
            return;
        }

        info!(
            "Starting group {} ({} forward(s)) via {}",
            runtime.name,
            pending.len(),
            definition.jump.id()
        );

        if let Err(e) = definition.jump.validate() {
            reject_all(&pending, &e).await;
            return;
        }

        // Bind conflicts fail only the conflicting forward
        let mut ready = Vec::with_capacity(pending.len());
        let mut planned: Vec<BindKey> = Vec::new();
        for controller in pending {
            match self.preflight(&definition, controller.spec(), &planned) {
                Some(err) => {
                    controller.reject(&err).await;
                }
                None => {
                    planned.push(BindKey::for_forward(controller.spec(), &definition.jump));
                    ready.push(controller);
                }
            }
        }
        if ready.is_empty() {
            return;
        }

        // Forwards wait in Connecting while the group establishes their session
        let (session_tx, session_rx) = watch::channel(None);
        let mut starts = JoinSet::new();
        for controller in &ready {
            let controller = Arc::clone(controller);
            let ticket = controller.ticket();
            let source = SessionSource::Group(session_rx.clone());
            starts.spawn(async move { controller.start_with(source, ticket).await });
        }

        let acquired = tokio::select! {
            biased;
            _ = stops.changed() => None,
            res = self.sessions.acquire(&definition.jump, credential) => Some(res),
        };
        let mut cancelled = acquired.is_none();
        let handle = match acquired {
            Some(Ok(handle)) => {
                let handle = Arc::new(handle);
                session_tx.send_replace(Some(Ok(Arc::clone(&handle))));
                Some(handle)
            }
            Some(Err(e)) => {
                warn!("Group {}: {}", runtime.name, e);
                session_tx.send_replace(Some(Err(ErrorDetail::from(&e))));
                None
            }
            None => {
                info!("Group {} stopped while connecting", runtime.name);
                request_stop_all(&ready);
                None
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = stops.changed(), if !cancelled => {
                    cancelled = true;
                    request_stop_all(&ready);
                }
                res = starts.join_next() => match res {
                    Some(Err(e)) => warn!("Group {}: start task failed: {}", runtime.name, e),
                    Some(Ok(_)) => {}
                    None => break,
                },
            }
        }

        // Every started forward now holds its own reference
        if let Some(handle) = handle {
            handle.release().await;
        }
    }

    async fn stop_locked(&self, runtime: &GroupRuntime) {
        let (definition, controllers) = {
            let members = lock(&runtime.members);
            (members.definition.clone(), members.controllers.clone())
        };
        info!("Stopping group {}", runtime.name);
        let was_active: Vec<bool> = controllers
            .iter()
            .map(|c| c.state() == ForwardState::Active)
            .collect();
        stop_all(controllers.clone()).await;

        // Listener close failures are reported, never retried
        for (controller, was_active) in controllers.iter().zip(was_active) {
            if !was_active || controller.state() != ForwardState::Stopped {
                continue;
            }
            if let Some(err) = controller.status().last_error {
                warn!(
                    "Group {}: {} stopped uncleanly: {}",
                    runtime.name,
                    controller.id(),
                    err
                );
            }
        }

        let id = definition.jump.id();
        match self.sessions.session_info(&id) {
            None => info!("Group {} stopped, session {} torn down", runtime.name, id),
            Some(info) => debug!(
                "Group {} stopped, session {} still used by {} forward(s)",
                runtime.name, id, info.refs
            ),
        }
    }

    /// Conflict with a live claim or with a forward planned earlier in this start
    fn preflight(
        &self,
        definition: &TunnelGroup,
        spec: &ForwardSpec,
        planned: &[BindKey],
    ) -> Option<TunnelError> {
        let key = BindKey::for_forward(spec, &definition.jump);
        if let Some(owner) = self.binds.conflict(&key) {
            return Some(TunnelError::BindConflict(format!(
                "{key} is already claimed by {owner}"
            )));
        }
        if planned.iter().any(|k| k.conflicts_with(&key)) {
            return Some(TunnelError::BindConflict(format!(
                "{key} is claimed twice in group {}",
                definition.name
            )));
        }
        None
    }

    /// Rebuild the controllers of an idle group if its definition changed
    fn refresh(&self, runtime: &GroupRuntime) {
        let Some(fresh) = self.store.get(&runtime.name) else {
            return;
        };
        let mut members = lock(&runtime.members);
        if members.is_running() || members.definition == fresh {
            return;
        }
        debug!("Group {}: applying new definition", runtime.name);
        members.controllers = self.controllers_for(&fresh);
        members.definition = fresh;
    }

    fn runtime(&self, name: &str) -> TunnelResult<Arc<GroupRuntime>> {
        let mut groups = self.lock_groups();
        if let Some(runtime) = groups.get(name) {
            return Ok(Arc::clone(runtime));
        }

        let definition = self.store.get(name).ok_or_else(|| unknown_group(name))?;
        let runtime = Arc::new(GroupRuntime {
            name: name.to_string(),
            op: tokio::sync::Mutex::new(()),
            stops: watch::Sender::new(0),
            members: Mutex::new(Members {
                controllers: self.controllers_for(&definition),
                definition,
            }),
        });
        groups.insert(name.to_string(), Arc::clone(&runtime));
        Ok(runtime)
    }

    fn controllers_for(&self, definition: &TunnelGroup) -> Vec<Arc<ForwardController>> {
        let ctx = Arc::new(ForwardContext {
            group: definition.name.clone(),
            jump: definition.jump.clone(),
            sessions: Arc::clone(&self.sessions),
            binds: Arc::clone(&self.binds),
            events: self.events.clone(),
            bind_timeout: self.options.bind_timeout,
        });
        definition
            .forwards
            .iter()
            .map(|spec| Arc::new(ForwardController::new(spec.clone(), Arc::clone(&ctx))))
            .collect()
    }

    fn status_of(&self, runtime: &GroupRuntime) -> GroupStatus {
        let members = lock(&runtime.members);
        let forwards: Vec<ForwardStatus> = members.controllers.iter().map(|c| c.status()).collect();
        GroupStatus {
            name: runtime.name.clone(),
            state: GroupState::derive(forwards.iter().map(|f| f.state)),
            forwards,
            session: self.sessions.session_info(&members.definition.jump.id()),
        }
    }

    fn lock_groups(&self) -> MutexGuard<'_, HashMap<String, Arc<GroupRuntime>>> {
        lock(&self.groups)
    }
}

fn find(members: &Members, forward: &str) -> TunnelResult<Arc<ForwardController>> {
    members
        .controllers
        .iter()
        .find(|c| c.id() == forward)
        .cloned()
        .ok_or_else(|| {
            TunnelError::config(format!(
                "Group {} has no forward {}",
                members.definition.name, forward
            ))
        })
}

async fn reject_all(controllers: &[Arc<ForwardController>], err: &TunnelError) {
    for controller in controllers {
        controller.reject(err).await;
    }
}

fn request_stop_all(controllers: &[Arc<ForwardController>]) {
    for controller in controllers {
        controller.request_stop();
    }
}

async fn stop_all(controllers: Vec<Arc<ForwardController>>) {
    let mut stops = JoinSet::new();
    for controller in controllers {
        stops.spawn(async move { controller.stop().await });
    }
    while let Some(res) = stops.join_next().await {
        if let Err(e) = res {
            warn!("Stop task failed: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
