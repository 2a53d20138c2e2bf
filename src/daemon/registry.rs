// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The session registry: the one place that maps ids and names to
//! sessions. The maps live behind a short critical section used only
//! for insert, remove and lookup; everything stateful about a
//! session happens in its actor.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, instrument, warn};

use crate::{
    config,
    consts,
    daemon::{
        events::EventBus,
        messages::MessageRouter,
        session::{self, LaunchSpec, SessionCommand, SessionHandle},
        store::StoreHandle,
        wait,
    },
    hooks::Hooks,
    protocol::{SessionInfo, SessionSelector, WaitCondition},
};

/// A launch as requested over the wire, before the registry assigns
/// an id and reserves the name.
#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<String>,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub stdin_data: Option<Vec<u8>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

struct Table {
    by_id: BTreeMap<u32, SessionHandle>,
    /// Only non-terminal sessions hold their name here; the janitor
    /// frees the slot on the terminal transition.
    by_name: HashMap<String, u32>,
    next_id: u32,
}

struct Shared {
    table: Mutex<Table>,
    bus: EventBus,
    store: StoreHandle,
    router: MessageRouter,
    hooks: Arc<dyn Hooks + Send + Sync>,
    config: config::Config,
    exit_tx: mpsc::UnboundedSender<u32>,
}

#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    pub fn new(
        bus: EventBus,
        store: StoreHandle,
        router: MessageRouter,
        hooks: Arc<dyn Hooks + Send + Sync>,
        config: config::Config,
        restored: Vec<SessionInfo>,
    ) -> Registry {
        let mut by_id = BTreeMap::new();
        let mut next_id = 1;
        for info in restored {
            next_id = next_id.max(info.id + 1);
            by_id.insert(info.id, SessionHandle::finished(info));
        }

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Registry {
            shared: Arc::new(Shared {
                table: Mutex::new(Table { by_id, by_name: HashMap::new(), next_id }),
                bus,
                store,
                router,
                hooks,
                config,
                exit_tx,
            }),
        };

        tokio::spawn(janitor(registry.clone(), exit_rx));
        registry.persist();
        registry
    }

    /// Create a session: reserve the name, allocate the id, spawn
    /// the child. A failed spawn releases the reservation and leaves
    /// the node unchanged.
    #[instrument(skip_all, fields(name = ?params.name))]
    pub fn launch(&self, params: LaunchParams) -> anyhow::Result<u32> {
        if let Some(name) = &params.name {
            validate_name(name)?;
        }

        let id = {
            let mut table = self.shared.table.lock().unwrap();
            if let Some(name) = &params.name {
                if table.by_name.contains_key(name) {
                    return Err(anyhow!("name {name} in use"));
                }
            }
            let id = table.next_id;
            table.next_id += 1;
            if let Some(name) = &params.name {
                table.by_name.insert(name.clone(), id);
            }
            id
        };

        let mut extra_env: Vec<(String, String)> = self
            .shared
            .config
            .env
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        extra_env.sort();

        let spec = LaunchSpec {
            id,
            name: params.name.clone(),
            cmd: params.cmd,
            cwd: params.cwd,
            env: params.env,
            extra_env,
            tags: params.tags,
            stdin_data: params.stdin_data,
            cols: params.cols,
            rows: params.rows,
        };

        let handle = match session::spawn(
            spec,
            self.shared.config.output_ring_bytes(),
            self.shared.config.attacher_high_water(),
            self.shared.bus.clone(),
            self.shared.exit_tx.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let mut table = self.shared.table.lock().unwrap();
                if let Some(name) = &params.name {
                    if table.by_name.get(name) == Some(&id) {
                        table.by_name.remove(name);
                    }
                }
                return Err(e);
            }
        };

        {
            let mut table = self.shared.table.lock().unwrap();
            table.by_id.insert(id, handle);
        }

        if let Err(e) = self.shared.hooks.on_session_start(id, params.name.as_deref()) {
            warn!("session_start hook: {:?}", e);
        }
        self.persist();

        Ok(id)
    }

    /// Look a session up by id or name. Names only resolve while the
    /// session is non-terminal.
    pub fn resolve(&self, selector: &SessionSelector) -> anyhow::Result<SessionHandle> {
        let table = self.shared.table.lock().unwrap();
        let handle = match (&selector.session_id, &selector.session_name) {
            (Some(id), _) => table.by_id.get(id),
            (None, Some(name)) => {
                table.by_name.get(name).and_then(|id| table.by_id.get(id))
            }
            (None, None) => None,
        };
        handle.cloned().ok_or_else(|| anyhow!("session {selector} not found"))
    }

    /// A consistent snapshot of every session still in the registry,
    /// terminal ones included.
    pub fn list(&self) -> Vec<SessionInfo> {
        let table = self.shared.table.lock().unwrap();
        table.by_id.values().map(|h| h.info()).collect()
    }

    /// The display name of a session, empty for anonymous (id 0) or
    /// unknown senders.
    pub fn session_name(&self, id: u32) -> String {
        if id == 0 {
            return String::new();
        }
        let table = self.shared.table.lock().unwrap();
        table
            .by_id
            .get(&id)
            .and_then(|h| h.info().name)
            .unwrap_or_default()
    }

    /// Kill every live session and evict terminal records. Returns
    /// the ids actually affected.
    pub async fn kill_all(&self) -> Vec<u32> {
        let handles: Vec<SessionHandle> = {
            let table = self.shared.table.lock().unwrap();
            table.by_id.values().cloned().collect()
        };

        let mut affected = vec![];
        let mut evicted = vec![];
        for handle in handles {
            if handle.is_live() {
                let (tx, rx) = oneshot::channel();
                if handle.send(SessionCommand::Kill { signal: None, reply: Some(tx) }).await {
                    let _ = rx.await;
                    affected.push(handle.id);
                } else {
                    evicted.push(handle.id);
                }
            } else {
                evicted.push(handle.id);
            }
        }

        if !evicted.is_empty() {
            let mut table = self.shared.table.lock().unwrap();
            for id in &evicted {
                table.by_id.remove(id);
            }
        }
        for id in &evicted {
            self.shared.router.evict(*id);
        }

        affected.extend(evicted);
        affected.sort_unstable();
        self.persist();
        affected
    }

    /// Kill the live sessions carrying every one of `tags`.
    pub async fn kill_by_tags(&self, tags: &[String]) -> Vec<u32> {
        let handles: Vec<SessionHandle> = {
            let table = self.shared.table.lock().unwrap();
            table
                .by_id
                .values()
                .filter(|h| h.is_live() && tags.iter().all(|t| h.tags.contains(t)))
                .cloned()
                .collect()
        };

        let mut affected = vec![];
        for handle in handles {
            let (tx, rx) = oneshot::channel();
            if handle.send(SessionCommand::Kill { signal: None, reply: Some(tx) }).await {
                let _ = rx.await;
                affected.push(handle.id);
            }
        }
        affected
    }

    /// Resolve the target set of a `Wait` at admission time.
    pub fn wait_targets(
        &self,
        session_id: Option<u32>,
        tags: &[String],
    ) -> Vec<(u32, watch::Receiver<SessionInfo>)> {
        let table = self.shared.table.lock().unwrap();
        match session_id {
            Some(id) => table
                .by_id
                .get(&id)
                .map(|h| vec![(id, h.info_rx.clone())])
                .unwrap_or_default(),
            None => table
                .by_id
                .values()
                .filter(|h| !tags.is_empty() && tags.iter().all(|t| h.tags.contains(t)))
                .map(|h| (h.id, h.info_rx.clone()))
                .collect(),
        }
    }

    /// Push the current catalogue at the persistence task. Called on
    /// every mutating event; the store task debounces the disk I/O.
    pub fn persist(&self) {
        self.shared.store.update(self.list());
    }

    /// Signal every live session and wait up to `grace` for all of
    /// them to reach a terminal status. Used on daemon shutdown.
    pub async fn shutdown(&self, grace: Duration) {
        let targets: Vec<(u32, watch::Receiver<SessionInfo>)> = {
            let table = self.shared.table.lock().unwrap();
            table
                .by_id
                .values()
                .filter(|h| h.is_live())
                .map(|h| (h.id, h.info_rx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        info!("shutting down {} live sessions", targets.len());
        for (id, _) in &targets {
            let selector = SessionSelector::id(*id);
            if let Ok(handle) = self.resolve(&selector) {
                let _ = handle.send(SessionCommand::Kill { signal: None, reply: None }).await;
            }
        }

        let (_, timed_out) =
            wait::wait_for_terminal(targets, WaitCondition::All, Some(grace)).await;
        if timed_out {
            warn!("some sessions did not exit within the shutdown grace period");
        }
    }
}

/// Reacts to terminal transitions reported by session actors: frees
/// the name slot, runs the lifecycle hook, persists the catalogue.
async fn janitor(registry: Registry, mut exit_rx: mpsc::UnboundedReceiver<u32>) {
    while let Some(id) = exit_rx.recv().await {
        {
            let mut table = registry.shared.table.lock().unwrap();
            let name = table.by_id.get(&id).and_then(|h| h.info().name);
            if let Some(name) = name {
                if table.by_name.get(&name) == Some(&id) {
                    table.by_name.remove(&name);
                }
            }
        }
        if let Err(e) = registry.shared.hooks.on_session_end(id) {
            warn!("session_end hook: {:?}", e);
        }
        registry.persist();
    }
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        return Err(anyhow!("session name must not be empty"));
    }
    if name.len() > consts::MAX_NAME_LEN {
        return Err(anyhow!(
            "session name exceeds {} characters",
            consts::MAX_NAME_LEN
        ));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(anyhow!("session name must be printable"));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hooks::NoopHooks;

    fn test_registry() -> Registry {
        let bus = EventBus::new(consts::DEFAULT_SUBSCRIPTION_BUFFER);
        let store = crate::daemon::store::spawn(std::env::temp_dir().join(format!(
            "codewire-registry-test-{}",
            std::process::id()
        )));
        let router = MessageRouter::new(bus.clone(), consts::DEFAULT_INBOX_CAP);
        Registry::new(bus, store, router, Arc::new(NoopHooks), config::Config::default(), vec![])
    }

    fn sleep_params(name: Option<&str>) -> LaunchParams {
        LaunchParams {
            cmd: vec![String::from("sleep"), String::from("5")],
            cwd: Some(String::from("/tmp")),
            name: name.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ids_are_monotonic_and_names_unique() -> anyhow::Result<()> {
        let registry = test_registry();

        let a = registry.launch(sleep_params(Some("alpha")))?;
        let b = registry.launch(sleep_params(None))?;
        assert!(b > a);

        let err = registry.launch(sleep_params(Some("alpha"))).unwrap_err();
        assert!(err.to_string().contains("name alpha in use"));

        let by_name = registry
            .resolve(&SessionSelector { session_id: None, session_name: Some(String::from("alpha")) })?;
        assert_eq!(by_name.id, a);

        let killed = registry.kill_all().await;
        assert_eq!(killed, vec![a, b]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_spawn_releases_the_name() -> anyhow::Result<()> {
        let registry = test_registry();

        let mut params = sleep_params(Some("ghost"));
        params.cmd = vec![String::from("/definitely/not/a/binary")];
        assert!(registry.launch(params).is_err());

        // the reservation is gone, no phantom session exists
        assert!(registry.list().is_empty());
        let id = registry.launch(sleep_params(Some("ghost")))?;
        registry
            .resolve(&SessionSelector { session_id: Some(id), session_name: None })
            .expect("session exists");

        registry.kill_all().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restored_sessions_keep_ids_and_stay_addressable() {
        let bus = EventBus::new(consts::DEFAULT_SUBSCRIPTION_BUFFER);
        let store = crate::daemon::store::spawn(std::env::temp_dir().join(format!(
            "codewire-restore-test-{}",
            std::process::id()
        )));
        let router = MessageRouter::new(bus.clone(), consts::DEFAULT_INBOX_CAP);

        let restored = SessionInfo {
            id: 17,
            name: Some(String::from("old")),
            prompt: String::from("true"),
            cmd: vec![String::from("true")],
            cwd: String::from("/"),
            env: vec![],
            tags: vec![],
            created_at: String::from("2024-01-01T00:00:00+00:00"),
            completed_at: Some(String::from("2024-01-01T00:00:01+00:00")),
            exit_code: Some(0),
            status: crate::protocol::SessionStatus::Completed,
            pid: None,
            attached_count: 0,
            output_bytes: 0,
            output_lines: 0,
            last_output_at: None,
        };
        let registry = Registry::new(
            bus,
            store,
            router,
            Arc::new(NoopHooks),
            config::Config::default(),
            vec![restored],
        );

        // terminal restores are addressable by id but not by name
        let by_id =
            registry.resolve(&SessionSelector { session_id: Some(17), session_name: None });
        assert!(by_id.is_ok());
        assert!(!by_id.unwrap().is_live());
        assert!(registry
            .resolve(&SessionSelector { session_id: None, session_name: Some(String::from("old")) })
            .is_err());

        // and the id allocator moved past them
        let fresh = registry.launch(LaunchParams {
            cmd: vec![String::from("true")],
            ..Default::default()
        });
        if let Ok(id) = fresh {
            assert!(id > 17);
        }
    }
}
