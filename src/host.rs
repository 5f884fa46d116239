//! Host-wide duties: base layout, server creation, autostart, host heartbeat and LAN announcements.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::stat::{umask, Mode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::events::Event;
use crate::identity::Owner;
use crate::protocol::lan::{LanBroadcaster, BROADCAST_INTERVAL};
use crate::registry::ServerRegistry;
use crate::server::env::{dirs, valid_server_name};
use crate::server::ServerError;
use crate::supervisor::command::{lenient_string, parse_request};
use crate::supervisor::{SupervisorError, SupervisorResult};
use crate::utils;

const AUTOSTART_PAUSE: Duration = Duration::from_secs(10);

/// umask 002, the five base subdirectories, and a world-writable `import/`.
pub fn prepare_base(base_dir: &Path) -> std::io::Result<()> {
    umask(Mode::from_bits_truncate(0o002));
    for dir in dirs::ALL {
        std::fs::create_dir_all(base_dir.join(dir))?;
    }
    std::fs::set_permissions(base_dir.join(dirs::IMPORT), std::fs::Permissions::from_mode(0o777))?;
    Ok(())
}

pub fn log_dependencies() {
    for (tool, path) in utils::dependencies() {
        match path {
            Some(p) => tracing::info!("Found {}: {}", tool, p.display()),
            None => tracing::warn!("{} not found in PATH; features depending on it will fail", tool),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    Create {
        #[serde(deserialize_with = "lenient_string")]
        server_name: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    CreateUnconventionalServer {
        #[serde(deserialize_with = "lenient_string")]
        server_name: String,
    },
    CreateFromArchive {
        #[serde(deserialize_with = "lenient_string")]
        new_server_name: String,
        #[serde(deserialize_with = "lenient_string")]
        filename: String,
        /// Take the archive from this server's archive dir instead of `import/`.
        #[serde(default)]
        awd_dir: Option<String>,
    },
    RefreshServerList,
}

impl HostCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::Create { .. } => "create",
            HostCommand::CreateUnconventionalServer { .. } => "create_unconventional_server",
            HostCommand::CreateFromArchive { .. } => "create_from_archive",
            HostCommand::RefreshServerList => "refresh_server_list",
        }
    }
}

/// One file waiting in `import/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportableArchive {
    pub filename: String,
    pub size: u64,
    /// mtime, ms since epoch
    pub time: u64,
}

pub struct Host {
    config: DaemonConfig,
    registry: Arc<ServerRegistry>,
}

impl Host {
    pub fn new(config: DaemonConfig, registry: Arc<ServerRegistry>) -> Arc<Self> {
        Arc::new(Self { config, registry })
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Run a host command for `user` and report it as `host_notice`.
    pub async fn dispatch(&self, user: &str, request: Value) -> SupervisorResult<()> {
        let command_name = request
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let outcome = match parse_request::<HostCommand>(&request) {
            Ok(cmd) => self.run(user, cmd).await,
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(()) => tracing::info!("[HOST] {} by {} succeeded", command_name, user),
            Err(e) => tracing::warn!("[HOST] {} by {} failed: {}", command_name, user, e),
        }
        self.registry.bus().emit(Event::HostNotice {
            command: command_name,
            success: outcome.is_ok(),
            help_text: outcome.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
        });
        outcome
    }

    async fn run(&self, user: &str, cmd: HostCommand) -> SupervisorResult<()> {
        match cmd {
            HostCommand::Create { server_name, properties } => self.create(user, &server_name, &properties).await,
            HostCommand::CreateUnconventionalServer { server_name } => {
                let owner = self.creator(user, &server_name)?;
                self.registry.instance(&server_name).create_unconventional_server(owner).await?;
                self.registry.sync().await;
                Ok(())
            }
            HostCommand::CreateFromArchive { new_server_name, filename, awd_dir } => {
                let owner = self.creator(user, &new_server_name)?;
                let filepath = match awd_dir {
                    Some(awd) if !awd.is_empty() => self
                        .registry
                        .base_dir()
                        .join(dirs::ARCHIVE)
                        .join(awd)
                        .join(&filename)
                        .display()
                        .to_string(),
                    _ => filename,
                };
                self.registry
                    .instance(&new_server_name)
                    .create_from_archive(owner, &filepath)
                    .await?;
                self.registry.sync().await;
                Ok(())
            }
            HostCommand::RefreshServerList => {
                self.refresh_server_list().await;
                self.send_importable_list().await;
                Ok(())
            }
        }
    }

    /// Name and creator checks shared by every create flavour.
    fn creator(&self, user: &str, server_name: &str) -> SupervisorResult<Owner> {
        if !valid_server_name(server_name) {
            return Err(SupervisorError::InvalidArgument(format!("invalid server name '{}'", server_name)));
        }
        if !self.config.may_create(user) {
            return Err(SupervisorError::PermissionDenied(format!(
                "User {} is not authorized to create servers",
                user
            )));
        }
        self.registry
            .identity()
            .user_credentials(user)
            .ok_or_else(|| ServerError::Ownership(format!("unknown user {}", user)).into())
    }

    pub async fn create(&self, user: &str, server_name: &str, properties: &Map<String, Value>) -> SupervisorResult<()> {
        let owner = self.creator(user, server_name)?;
        let instance = self.registry.instance(server_name);
        instance.create(owner).await?;

        let overlay: Vec<(String, String)> = properties
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k.clone(), s.clone())),
                Value::Number(n) => Some((k.clone(), n.to_string())),
                Value::Bool(b) => Some((k.clone(), b.to_string())),
                _ => None,
            })
            .collect();
        instance
            .overlay_sp(overlay.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .await?;
        tracing::info!("[{}] Server created in filesystem by {}", server_name, user);
        self.registry.sync().await;
        Ok(())
    }

    pub async fn refresh_server_list(&self) {
        for name in self.registry.names().await {
            self.registry.bus().emit(Event::TrackServer { server_name: name });
        }
    }

    /// Files in `import/`, oldest first.
    pub async fn importable_archives(&self) -> std::io::Result<Vec<ImportableArchive>> {
        let dir = self.registry.base_dir().join(dirs::IMPORT);
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            out.push(ImportableArchive {
                filename: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                time,
            });
        }
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.filename.cmp(&b.filename)));
        Ok(out)
    }

    pub async fn send_importable_list(&self) {
        match self.importable_archives().await {
            Ok(list) => self.registry.bus().emit(Event::ArchiveList {
                payload: serde_json::to_value(list).unwrap_or(Value::Null),
            }),
            Err(e) => tracing::warn!("Could not list importable archives: {}", e),
        }
    }

    /// Boot-time starts, one instance at a time.
    pub async fn autostart(&self) {
        tokio::time::sleep(Duration::from_secs(self.config.autostart_delay_secs)).await;
        for supervisor in self.registry.supervisors().await {
            match supervisor.onreboot_start().await {
                Ok(true) => tokio::time::sleep(AUTOSTART_PAUSE).await,
                Ok(false) => {}
                Err(e) => tracing::warn!("[{}] Autostart failed: {}", supervisor.server_name(), e),
            }
        }
    }

    /// Host heartbeat, LAN announcements and autostart, all stopped by `cancel`.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let interval = Duration::from_millis(self.config.host_heartbeat_interval_ms);
        let bus = self.registry.bus().clone();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut stats = HostStats::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => bus.emit(stats.sample()),
                }
            }
        }));

        if self.config.lan_broadcast {
            let registry = self.registry.clone();
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut broadcaster = LanBroadcaster::new();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(BROADCAST_INTERVAL) => {}
                    }
                    for supervisor in registry.supervisors().await {
                        if let Some(announcement) = supervisor.broadcast_to_lan().await {
                            if let Err(e) = broadcaster.announce(&announcement).await {
                                tracing::debug!("[{}] LAN broadcast failed: {}", supervisor.server_name(), e);
                            }
                        }
                    }
                }
            }));
        }

        let host = self.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = host.autostart() => {}
            }
        }));
        handles
    }
}

/// Uptime, available memory and load average of this machine.
pub struct HostStats {
    sys: System,
}

impl Default for HostStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStats {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    pub fn sample(&mut self) -> Event {
        self.sys.refresh_memory();
        let load = System::load_average();
        Event::HostHeartbeat {
            uptime: System::uptime(),
            freemem: self.sys.available_memory(),
            loadavg: [load.one, load.five, load.fifteen],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::identity::StaticIdentity;
    use crate::supervisor::SupervisorOptions;
    use serde_json::json;

    fn host(base: &Path, creators: Option<&str>) -> Arc<Host> {
        prepare_base(base).unwrap();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let identity = StaticIdentity::new()
            .with_user(uid, "steve", gid)
            .with_group(gid, "steve", &[]);
        let registry = ServerRegistry::new(base, Arc::new(identity), EventBus::new(), SupervisorOptions::default());
        let config = DaemonConfig {
            base_directory: base.to_path_buf(),
            creators: creators.map(str::to_string),
            ..DaemonConfig::default()
        };
        Host::new(config, registry)
    }

    #[test]
    fn base_layout() {
        let base = tempfile::tempdir().unwrap();
        prepare_base(base.path()).unwrap();
        for dir in dirs::ALL {
            assert!(base.path().join(dir).is_dir());
        }
        let mode = std::fs::metadata(base.path().join(dirs::IMPORT)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[tokio::test]
    async fn create_overlays_properties_and_tracks() {
        let base = tempfile::tempdir().unwrap();
        let host = host(base.path(), None);
        let mut rx = host.registry().bus().subscribe();

        host.dispatch(
            "steve",
            json!({"command": "create", "server_name": "survival", "properties": {"server-port": 25570, "motd": "hi"}}),
        )
        .await
        .unwrap();

        let sup = host.registry().get("survival").await.unwrap();
        let sp = sup.server().sp().await.unwrap();
        assert_eq!(sp.get_general("server-port"), Some("25570"));
        assert_eq!(sp.get_general("motd"), Some("hi"));

        let mut saw_notice = false;
        while let Ok(ev) = rx.try_recv() {
            if let Event::HostNotice { command, success, .. } = ev {
                assert_eq!(command, "create");
                assert!(success);
                saw_notice = true;
            }
        }
        assert!(saw_notice);
        host.registry().shutdown().await;
    }

    #[tokio::test]
    async fn creators_whitelist_and_names_are_enforced() {
        let base = tempfile::tempdir().unwrap();
        let host = host(base.path(), Some("alex, herobrine"));
        let err = host
            .dispatch("steve", json!({"command": "create", "server_name": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::PermissionDenied(_)));

        let host = self::host(base.path(), None);
        let err = host
            .dispatch("steve", json!({"command": "create_unconventional_server", "server_name": ".dot"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArgument(_)));
        assert!(!base.path().join(dirs::SERVERS).join(".dot").exists());
    }

    #[tokio::test]
    async fn unknown_users_cannot_create() {
        let base = tempfile::tempdir().unwrap();
        let host = host(base.path(), None);
        let err = host
            .dispatch("nobody", json!({"command": "create", "server_name": "orphan"}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "OWNERSHIP_FAILED");
    }

    #[tokio::test]
    async fn importable_list_is_sorted_by_mtime() {
        let base = tempfile::tempdir().unwrap();
        let host = host(base.path(), None);
        let import = base.path().join(dirs::IMPORT);
        std::fs::write(import.join("new.zip"), b"PK").unwrap();
        std::fs::write(import.join("old.tar.gz"), b"xyz").unwrap();
        let old = std::fs::File::options().write(true).open(import.join("old.tar.gz")).unwrap();
        old.set_modified(std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)).unwrap();

        let list = host.importable_archives().await.unwrap();
        let names: Vec<&str> = list.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["old.tar.gz", "new.zip"]);
        assert_eq!(list[0].size, 3);
    }

    #[test]
    fn host_stats_sample() {
        let mut stats = HostStats::new();
        match stats.sample() {
            Event::HostHeartbeat { loadavg, .. } => assert!(loadavg.iter().all(|l| *l >= 0.0)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
