//! Name → supervisor map for every instance directory under `servers/`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBus};
use crate::identity::IdentityProvider;
use crate::server::env::{dirs, server_list, valid_server_name};
use crate::server::ManagedServer;
use crate::supervisor::{ServerSupervisor, SupervisorOptions};

enum Slot {
    /// Claimed, supervisor still being brought up.
    Pending,
    Ready(Arc<ServerSupervisor>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub struct ServerRegistry {
    base_dir: PathBuf,
    identity: Arc<dyn IdentityProvider>,
    bus: EventBus,
    options: SupervisorOptions,
    servers: Mutex<HashMap<String, Slot>>,
    /// Serializes whole sync batches.
    batch: Mutex<()>,
}

impl ServerRegistry {
    pub fn new(
        base_dir: &Path,
        identity: Arc<dyn IdentityProvider>,
        bus: EventBus,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            base_dir: base_dir.to_path_buf(),
            identity,
            bus,
            options,
            servers: Mutex::new(HashMap::new()),
            batch: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn identity(&self) -> Arc<dyn IdentityProvider> {
        self.identity.clone()
    }

    /// A detached handle on an instance, for operations that may precede tracking.
    pub fn instance(&self, name: &str) -> ManagedServer {
        ManagedServer::new(name, &self.base_dir, self.identity.clone())
    }

    /// Start supervising `name`. False when it is already known.
    pub async fn track(&self, name: &str) -> bool {
        {
            let mut servers = self.servers.lock().await;
            if servers.contains_key(name) {
                return false;
            }
            servers.insert(name.to_string(), Slot::Pending);
        }

        let supervisor = ServerSupervisor::new(self.instance(name), self.bus.clone(), self.options.clone());
        supervisor.start().await;
        self.servers
            .lock()
            .await
            .insert(name.to_string(), Slot::Ready(supervisor));

        tracing::info!("Discovered server: {}", name);
        self.bus.emit(Event::TrackServer { server_name: name.to_string() });
        true
    }

    /// Stop supervising `name`. Always announces the removal.
    pub async fn untrack(&self, name: &str) {
        let slot = self.servers.lock().await.remove(name);
        if let Some(Slot::Ready(supervisor)) = slot {
            supervisor.cleanup().await;
        }
        tracing::info!("Server removed: {}", name);
        self.bus.emit(Event::UntrackServer { server_name: name.to_string() });
    }

    /// Diff the directory listing against the known set and apply it.
    pub async fn sync(&self) -> SyncReport {
        let _batch = self.batch.lock().await;

        let on_disk: BTreeSet<String> = match server_list(&self.base_dir) {
            Ok(names) => names.into_iter().filter(|n| valid_server_name(n)).collect(),
            Err(e) => {
                tracing::warn!("Could not list servers: {}", e);
                return SyncReport::default();
            }
        };
        let known: BTreeSet<String> = self.servers.lock().await.keys().cloned().collect();

        let mut report = SyncReport::default();
        for name in on_disk.difference(&known) {
            if self.track(name).await {
                report.added.push(name.clone());
            }
        }
        for name in known.difference(&on_disk) {
            self.untrack(name).await;
            report.removed.push(name.clone());
        }
        report
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ServerSupervisor>> {
        match self.servers.lock().await.get(name) {
            Some(Slot::Ready(supervisor)) => Some(supervisor.clone()),
            _ => None,
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.servers.lock().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn supervisors(&self) -> Vec<Arc<ServerSupervisor>> {
        let servers = self.servers.lock().await;
        let mut ready: Vec<Arc<ServerSupervisor>> = servers
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(s) => Some(s.clone()),
                Slot::Pending => None,
            })
            .collect();
        ready.sort_by(|a, b| a.server_name().cmp(b.server_name()));
        ready
    }

    /// Re-sync on every change to the servers root until cancelled.
    pub fn watch(self: &Arc<Self>, cancel: CancellationToken) -> notify::Result<JoinHandle<()>> {
        let root = self.base_dir.join(dirs::SERVERS);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;

        let registry = self.clone();
        Ok(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = rx.recv() => match res {
                        Some(Ok(event)) if !event.kind.is_access() => {
                            let report = registry.sync().await;
                            if !report.added.is_empty() || !report.removed.is_empty() {
                                tracing::debug!("servers changed: +{:?} -{:?}", report.added, report.removed);
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => tracing::warn!("servers watch error: {}", e),
                        None => break,
                    },
                }
            }
        }))
    }

    /// Tear down every supervisor.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Slot)> = self.servers.lock().await.drain().collect();
        for (_, slot) in drained {
            if let Slot::Ready(supervisor) = slot {
                supervisor.cleanup().await;
            }
        }
    }
}
