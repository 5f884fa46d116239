//! Per-instance supervisor: tails, config watch, timers, cron and command dispatch.

pub mod command;
pub mod cron;
pub mod error;
pub mod notice;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine as _;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::events::{Event, EventBus, HeartbeatPayload};
use crate::protocol::lan::LanAnnouncement;
use crate::server::env::{CRON_CONFIG, EULA, SERVER_CONFIG, SERVER_PROPERTIES};
use crate::server::{CronEntry, ManagedServer, ServerError, ServerResult};
use crate::tail::TailWatcher;
use crate::utils::{now_millis, parse_bool};
use command::ServerCommand;
use cron::{CronFiring, CronScheduler};
pub use error::{SupervisorError, SupervisorResult};
use notice::{Notice, NoticeBoard};

const DEFAULT_LOGS: [&str; 4] = [
    "logs/latest.log",
    "server.log",
    "proxy.log.0",
    "logs/fml-server-latest.log",
];

const SERVER_ICON: &str = "server-icon.png";
const CONFIG_YML: &str = "config.yml";
const WATCHED_FILES: [&str; 6] = [SERVER_PROPERTIES, SERVER_CONFIG, CRON_CONFIG, EULA, SERVER_ICON, CONFIG_YML];
const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4e, 0x47];

const FILE_CHANGE_DELAY: Duration = Duration::from_millis(250);
const COMMIT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const GATHER_BACKOFF: u32 = 3;
pub const FILE_HEAD_LIMIT: u64 = 256_000;
const FILE_TOO_LARGE: &str = "File is too large (> 256 KB).  Only newly added lines will appear here.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub heartbeat_interval: Duration,
    /// Extra tails beyond the standard server logs, relative to the cwd.
    pub additional_logfiles: Vec<String>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(5000),
            additional_logfiles: Vec::new(),
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            additional_logfiles: config.additional_logfiles(),
        }
    }
}

/// Heartbeat sleep; widened while the previous gather is still running.
pub fn heartbeat_period(base: Duration, gathering: bool) -> Duration {
    if gathering {
        base * GATHER_BACKOFF
    } else {
        base
    }
}

/// Last applied auto-commit interval and the save timer running for it.
#[derive(Default)]
pub struct SaveTimer {
    applied: Option<u64>,
    token: Option<CancellationToken>,
}

impl SaveTimer {
    pub fn applied(&self) -> Option<u64> {
        self.applied
    }

    /// Switch to `wanted` minutes. Only a changed value stops the old timer; the
    /// returned token belongs to a timer the caller has to start.
    pub fn retarget(&mut self, wanted: Option<u64>, parent: &CancellationToken) -> Option<(u64, CancellationToken)> {
        if wanted == self.applied {
            return None;
        }
        if let Some(old) = self.token.take() {
            old.cancel();
        }
        self.applied = wanted;
        let minutes = wanted?;
        let token = parent.child_token();
        self.token = Some(token.clone());
        Some((minutes, token))
    }
}

pub struct ServerSupervisor {
    server: ManagedServer,
    bus: EventBus,
    options: SupervisorOptions,
    tails: Mutex<HashMap<String, TailWatcher>>,
    notices: Mutex<NoticeBoard>,
    cron: tokio::sync::Mutex<Option<CronScheduler>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

// 락 poisoning은 무시하고 내부 값을 그대로 사용
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ServerSupervisor {
    pub fn new(server: ManagedServer, bus: EventBus, options: SupervisorOptions) -> Arc<Self> {
        Arc::new(Self {
            server,
            bus,
            options,
            tails: Mutex::new(HashMap::new()),
            notices: Mutex::new(NoticeBoard::new()),
            cron: tokio::sync::Mutex::new(None),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn server(&self) -> &ManagedServer {
        &self.server
    }

    pub fn server_name(&self) -> &str {
        &self.server.server_name
    }

    fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    /// Register a background task so `cleanup` aborts it. After cleanup the task is aborted at once.
    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        if self.is_closed() {
            handle.abort();
            return;
        }
        tasks.push(handle);
    }

    // ─── Startup ───────────────────────────────────────────

    /// Bring every background activity of the instance up.
    pub async fn start(self: &Arc<Self>) {
        let name = self.server_name().to_string();

        if !(self.server.env.backup_dir.exists() && self.server.env.archive_dir.exists()) {
            if let Err(e) = self.server.sync_chown().await {
                tracing::warn!("[{}] Could not prepare backup/archive dirs: {}", name, e);
            }
        }

        let mut logs: Vec<String> = DEFAULT_LOGS.iter().map(|s| s.to_string()).collect();
        for extra in &self.options.additional_logfiles {
            if !logs.contains(extra) {
                logs.push(extra.clone());
            }
        }
        for rel in &logs {
            self.open_tail(rel);
        }

        if let Err(e) = self.watch_config() {
            tracing::warn!("[{}] Config watcher unavailable: {}", name, e);
        }

        let (firings_tx, firings_rx) = mpsc::unbounded_channel();
        match CronScheduler::new(&name, firings_tx).await {
            Ok(scheduler) => {
                *self.cron.lock().await = Some(scheduler);
                self.track_task(tokio::spawn(self.clone().cron_loop(firings_rx)));
                if let Err(e) = self.reload_cron().await {
                    tracing::warn!("[{}] Cron reload failed: {}", name, e);
                }
            }
            Err(e) => tracing::error!("[{}] Cron scheduler unavailable: {}", name, e),
        }

        self.track_task(tokio::spawn(self.clone().heartbeat_loop()));
        self.track_task(tokio::spawn(self.clone().commit_loop()));
        tracing::info!("[{}] Supervisor started ({} tails)", name, logs.len());
    }

    /// Follow `rel` under the cwd and forward each line as `tail_data`.
    pub fn open_tail(&self, rel: &str) {
        let mut tails = lock(&self.tails);
        if tails.contains_key(rel) {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(&self.server.env.cwd, rel, tx);
        tails.insert(rel.to_string(), tail);
        drop(tails);

        let bus = self.bus.clone();
        let server_name = self.server_name().to_string();
        let filepath = rel.to_string();
        self.track_task(tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                bus.emit(Event::TailData {
                    server_name: server_name.clone(),
                    filepath: filepath.clone(),
                    payload: line,
                });
            }
        }));
    }

    pub fn open_tails(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.tails).keys().cloned().collect();
        names.sort();
        names
    }

    fn watch_config(self: &Arc<Self>) -> notify::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.server.env.cwd, RecursiveMode::NonRecursive)?;
        *lock(&self.watcher) = Some(watcher);

        let me = self.clone();
        self.track_task(tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!("[{}] watch error: {}", me.server_name(), e);
                        continue;
                    }
                };
                if event.kind.is_access() {
                    continue;
                }
                for path in &event.paths {
                    let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
                        continue;
                    };
                    if let Some(watched) = WATCHED_FILES.iter().copied().find(|w| *w == file) {
                        let delayed = me.clone();
                        me.track_task(tokio::spawn(async move {
                            tokio::time::sleep(FILE_CHANGE_DELAY).await;
                            if !delayed.cancel.is_cancelled() {
                                delayed.on_config_change(watched).await;
                            }
                        }));
                    }
                }
            }
        }));
        Ok(())
    }

    async fn on_config_change(&self, file: &str) {
        tracing::debug!("[{}] {} changed", self.server_name(), file);
        match file {
            SERVER_PROPERTIES => self.broadcast_sp().await,
            SERVER_CONFIG => self.broadcast_sc().await,
            CRON_CONFIG => {
                if let Err(e) = self.reload_cron().await {
                    tracing::warn!("[{}] Cron reload failed: {}", self.server_name(), e);
                }
                self.broadcast_cc().await;
            }
            EULA => self.emit_eula().await,
            SERVER_ICON => self.broadcast_icon().await,
            CONFIG_YML => self.broadcast_cy().await,
            _ => {}
        }
    }

    // ─── Timers ────────────────────────────────────────────

    async fn heartbeat_loop(self: Arc<Self>) {
        let gathering = Arc::new(AtomicBool::new(false));
        loop {
            let period = heartbeat_period(self.options.heartbeat_interval, gathering.load(Ordering::Acquire));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            if gathering.swap(true, Ordering::AcqRel) {
                continue;
            }
            let me = self.clone();
            let flag = gathering.clone();
            self.track_task(tokio::spawn(async move {
                me.emit_heartbeat().await;
                flag.store(false, Ordering::Release);
            }));
        }
    }

    pub async fn heartbeat(&self) -> HeartbeatPayload {
        let server = &self.server;
        let (up, memory, ping, query) = tokio::join!(
            server.is_up(),
            async {
                match server.memory().await {
                    Ok(status) => json!(status),
                    Err(_) => json!({}),
                }
            },
            async {
                let unconventional = match server.sc().await {
                    Ok(sc) => parse_bool(sc.get("minecraft", "unconventional")),
                    Err(_) => false,
                };
                if unconventional {
                    return json!({});
                }
                match server.ping().await {
                    Ok(result) => serde_json::to_value(result).unwrap_or_else(|_| json!({})),
                    Err(_) => json!({}),
                }
            },
            async {
                let enabled = match server.sp().await {
                    Ok(sp) => parse_bool(sp.get_general("enable-query")),
                    Err(_) => false,
                };
                if enabled {
                    server.query().await
                } else {
                    json!({})
                }
            },
        );
        HeartbeatPayload { up, memory, ping, query }
    }

    async fn emit_heartbeat(&self) {
        let payload = self.heartbeat().await;
        self.emit(Event::Heartbeat {
            server_name: self.server_name().to_string(),
            timestamp: now_millis(),
            payload,
        });
    }

    async fn commit_loop(self: Arc<Self>) {
        let mut timer = SaveTimer::default();
        loop {
            let wanted = self.server.commit_interval().await.unwrap_or(None);
            if let Some((minutes, token)) = timer.retarget(wanted, &self.cancel) {
                tracing::info!("[{}] World commit every {} minute(s)", self.server_name(), minutes);
                self.track_task(tokio::spawn(self.clone().save_loop(minutes, token)));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(COMMIT_CHECK_INTERVAL) => {}
            }
        }
    }

    async fn save_loop(self: Arc<Self>, minutes: u64, token: CancellationToken) {
        let period = Duration::from_secs(minutes * 60);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            if self.server.is_up().await {
                if let Err(e) = self.server.saveall(None).await {
                    tracing::warn!("[{}] Scheduled save-all failed: {}", self.server_name(), e);
                }
            }
        }
    }

    async fn cron_loop(self: Arc<Self>, mut firings: mpsc::UnboundedReceiver<CronFiring>) {
        while let Some(firing) = firings.recv().await {
            if self.is_closed() {
                tracing::debug!("[{}] cron job {} fired after cleanup, skipped", self.server_name(), firing.hash);
                continue;
            }
            let me = self.clone();
            self.track_task(tokio::spawn(async move {
                me.run_cron(firing).await;
            }));
        }
    }

    // ─── Dispatch ──────────────────────────────────────────

    /// Run one inbound command for `user`. Always emits one ack and one fin.
    pub async fn dispatch(&self, user: &str, request: Value) -> Notice {
        let notice = Notice::acknowledge(&request);
        self.emit(Event::ServerAck {
            server_name: self.server_name().to_string(),
            notice: notice.clone(),
        });

        let parsed = ServerCommand::parse(&request);
        let record = !matches!(&parsed, Ok(cmd) if cmd.is_destructive());
        let outcome = match parsed {
            Ok(cmd) => match self.authorize(user, &cmd).await {
                Ok(()) => self.execute(&cmd).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::warn!("[{}] {} by {} failed: {}", self.server_name(), notice.command, user, e);
        }
        self.finish(notice, outcome, record)
    }

    /// A cron job came due: same completion contract, no user to check.
    pub async fn run_cron(&self, firing: CronFiring) -> Notice {
        let request = firing.entry.request();
        let notice = Notice::acknowledge(&request);
        self.emit(Event::ServerAck {
            server_name: self.server_name().to_string(),
            notice: notice.clone(),
        });

        let parsed = ServerCommand::parse(&request);
        let record = !matches!(&parsed, Ok(cmd) if cmd.is_destructive());
        let outcome = match parsed {
            Ok(cmd) => self.execute(&cmd).await,
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(_) => tracing::info!("[{}] cron {} ran {}", self.server_name(), firing.hash, notice.command),
            Err(e) => tracing::error!("[{}] cron {} ({}) failed: {}", self.server_name(), firing.hash, notice.command, e),
        }
        self.finish(notice, outcome, record)
    }

    async fn authorize(&self, user: &str, cmd: &ServerCommand) -> SupervisorResult<()> {
        let owner = self.server.owner_info().await?;
        if !self.server.identity().test_membership(user, &owner.groupname) {
            return Err(SupervisorError::PermissionDenied(format!(
                "User {} does not have permissions on {}",
                user,
                self.server_name()
            )));
        }
        if let ServerCommand::Chown { uid, .. } = cmd {
            if owner.username != user {
                return Err(SupervisorError::PermissionDenied(
                    "Only the current user owner may reassign server ownership.".into(),
                ));
            }
            if *uid != owner.uid {
                return Err(SupervisorError::PermissionDenied(
                    "You may not change the user owner of the server.".into(),
                ));
            }
        }
        Ok(())
    }

    async fn execute(&self, cmd: &ServerCommand) -> SupervisorResult<Value> {
        if cmd.is_destructive() {
            self.cleanup().await;
        }
        tracing::info!("[{}] Running {}", self.server_name(), cmd.name());
        Ok(cmd.execute(&self.server).await?)
    }

    fn finish(&self, mut notice: Notice, outcome: SupervisorResult<Value>, record: bool) -> Notice {
        notice.resolve(outcome.map_err(|e| e.to_string()));
        self.emit(Event::ServerFin {
            server_name: self.server_name().to_string(),
            notice: notice.clone(),
        });
        if record {
            lock(&self.notices).push(notice.clone());
        }
        notice
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).snapshot()
    }

    pub fn broadcast_notices(&self) {
        self.emit(Event::Notices {
            server_name: self.server_name().to_string(),
            payload: self.notices(),
        });
    }

    // ─── Requests answered by event ────────────────────────

    pub async fn get_file_contents(&self, rel: &str) -> ServerResult<()> {
        let abs = match lock(&self.tails).get(rel) {
            Some(tail) => tail.abs_path().to_path_buf(),
            None => return Err(ServerError::NotFound(format!("no tail open for {}", rel))),
        };
        let meta = tokio::fs::metadata(&abs).await?;
        let payload = if meta.len() > FILE_HEAD_LIMIT {
            FILE_TOO_LARGE.to_string()
        } else {
            String::from_utf8_lossy(&tokio::fs::read(&abs).await?).into_owned()
        };
        self.emit(Event::FileHead {
            server_name: self.server_name().to_string(),
            filename: rel.to_string(),
            payload,
        });
        Ok(())
    }

    pub async fn get_available_tails(&self) {
        for rel in self.open_tails() {
            if let Err(e) = self.get_file_contents(&rel).await {
                tracing::debug!("[{}] {} not readable: {}", self.server_name(), rel, e);
            }
        }
    }

    pub async fn get_prop(&self, property: &str) -> ServerResult<()> {
        let payload = self.server.property(property).await?;
        self.emit(Event::PropertyFin {
            server_name: self.server_name().to_string(),
            property: property.to_string(),
            payload,
        });
        Ok(())
    }

    pub async fn get_page_data(&self, page: &str) {
        let payload = match page {
            "glance" => Some(self.glance().await),
            _ => None,
        };
        self.emit(Event::PageData {
            server_name: self.server_name().to_string(),
            page: page.to_string(),
            payload,
        });
    }

    async fn glance(&self) -> Value {
        let s = &self.server;
        let prop = |name: &'static str| async move { s.property(name).await.unwrap_or(Value::Null) };
        let (increments, archives, du_awd, du_bwd, du_cwd, owner, server_files, ftb_installer, eula) = tokio::join!(
            async { s.list_increments().await.map(|v| json!(v)).unwrap_or_else(|_| json!([])) },
            async { s.list_archives().await.map(|v| json!(v)).unwrap_or_else(|_| json!([])) },
            prop("du_awd"),
            prop("du_bwd"),
            prop("du_cwd"),
            prop("owner"),
            prop("server_files"),
            prop("FTBInstall.sh"),
            prop("eula"),
        );
        json!({
            "increments": increments,
            "archives": archives,
            "du_awd": du_awd,
            "du_bwd": du_bwd,
            "du_cwd": du_cwd,
            "owner": owner,
            "server_files": server_files,
            "ftb_installer": ftb_installer,
            "eula": eula,
            "base_dir": s.env.base_dir.display().to_string(),
        })
    }

    // ─── Cron management ───────────────────────────────────

    /// `{operation, ...}` against `cron.config`; returns the affected hash.
    pub async fn manage_cron(&self, opts: &Value) -> ServerResult<String> {
        let mut options = opts.as_object().cloned().unwrap_or_default();
        let operation = match options.remove("operation") {
            Some(Value::String(op)) => op,
            _ => return Err(ServerError::InvalidArgument("cron operation missing".into())),
        };

        let hash = match operation.as_str() {
            "create" => {
                let entry = cron_entry_from(&options)?;
                let hash = cron::hash_options(&Value::Object(options));
                self.server.add_cron(&hash, &entry).await?;
                hash
            }
            "delete" | "start" | "suspend" => {
                let hash = match options.get("hash") {
                    Some(Value::String(h)) => h.clone(),
                    _ => return Err(ServerError::InvalidArgument("cron hash missing".into())),
                };
                match operation.as_str() {
                    "delete" => self.server.delete_cron(&hash).await?,
                    "start" => self.server.set_cron(&hash, true).await?,
                    _ => self.server.set_cron(&hash, false).await?,
                }
                hash
            }
            other => return Err(ServerError::InvalidArgument(format!("unknown cron operation '{}'", other))),
        };
        tracing::info!("[{}] cron {} {}", self.server_name(), operation, hash);

        if let Err(e) = self.reload_cron().await {
            tracing::warn!("[{}] Cron reload failed: {}", self.server_name(), e);
        }
        Ok(hash)
    }

    /// Rebuild every job from `cron.config`. Enabled entries that cannot be
    /// scheduled are written back disabled.
    pub async fn reload_cron(&self) -> ServerResult<()> {
        let crons = self.server.crons().await?;
        let report = {
            let mut guard = self.cron.lock().await;
            let Some(scheduler) = guard.as_mut() else {
                return Ok(());
            };
            scheduler
                .reload(&crons)
                .await
                .map_err(|e| ServerError::InvalidArgument(e.to_string()))?
        };
        for hash in &report.invalid {
            self.server.set_cron(hash, false).await?;
        }
        Ok(())
    }

    pub async fn cron_job_count(&self) -> usize {
        self.cron.lock().await.as_ref().map(CronScheduler::job_count).unwrap_or(0)
    }

    // ─── Broadcasts ────────────────────────────────────────

    pub async fn broadcast_sp(&self) {
        match self.server.sp().await {
            Ok(sp) => self.emit(Event::ServerProperties {
                server_name: self.server_name().to_string(),
                payload: serde_json::to_value(sp).unwrap_or(Value::Null),
            }),
            Err(e) => tracing::warn!("[{}] server.properties unreadable: {}", self.server_name(), e),
        }
    }

    pub async fn broadcast_sc(&self) {
        match self.server.sc().await {
            Ok(sc) => self.emit(Event::ServerConfig {
                server_name: self.server_name().to_string(),
                payload: serde_json::to_value(sc).unwrap_or(Value::Null),
            }),
            Err(e) => tracing::warn!("[{}] server.config unreadable: {}", self.server_name(), e),
        }
    }

    pub async fn broadcast_cc(&self) {
        match self.server.crons().await {
            Ok(crons) => self.emit(Event::CronConfig {
                server_name: self.server_name().to_string(),
                payload: serde_json::to_value(crons).unwrap_or(Value::Null),
            }),
            Err(e) => tracing::warn!("[{}] cron.config unreadable: {}", self.server_name(), e),
        }
    }

    pub async fn emit_eula(&self) {
        let accepted = self.server.eula().await.unwrap_or(None);
        self.emit(Event::Eula {
            server_name: self.server_name().to_string(),
            accepted,
        });
    }

    pub async fn broadcast_icon(&self) {
        let Ok(bytes) = tokio::fs::read(self.server.env.cwd.join(SERVER_ICON)).await else {
            return;
        };
        if !is_png(&bytes) {
            tracing::debug!("[{}] {} is not a PNG", self.server_name(), SERVER_ICON);
            return;
        }
        self.emit(Event::ServerIcon {
            server_name: self.server_name().to_string(),
            payload: base64::engine::general_purpose::STANDARD.encode(&bytes),
        });
    }

    pub async fn broadcast_cy(&self) {
        let Ok(bytes) = tokio::fs::read(self.server.env.cwd.join(CONFIG_YML)).await else {
            return;
        };
        self.emit(Event::ConfigYml {
            server_name: self.server_name().to_string(),
            payload: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }

    /// What to announce on the LAN, when the instance is up and opted in.
    pub async fn broadcast_to_lan(&self) -> Option<LanAnnouncement> {
        if !self.server.exists().await || !self.server.is_up().await {
            return None;
        }
        if !matches!(self.server.verify("broadcast").await, Ok(())) {
            return None;
        }
        let sp = self.server.sp().await.ok()?;
        let motd = sp.get_general("motd").unwrap_or("");
        let port = sp.get_general("server-port").unwrap_or("25565");
        let server_ip = sp.get_general("server-ip").unwrap_or("");
        Some(LanAnnouncement::new(motd, port, server_ip))
    }

    /// Start the instance if it is configured to come up with the host.
    pub async fn onreboot_start(&self) -> ServerResult<bool> {
        if !self.server.onreboot_enabled().await? {
            return Ok(false);
        }
        self.server.start().await?;
        tracing::info!("[{}] Started on boot", self.server_name());
        Ok(true)
    }

    // ─── Teardown ──────────────────────────────────────────

    /// Stop everything `start` brought up. Safe to call more than once.
    pub async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        for (_, tail) in lock(&self.tails).drain() {
            tail.close();
        }
        lock(&self.watcher).take();
        if let Some(mut scheduler) = self.cron.lock().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!("[{}] Cron shutdown failed: {}", self.server_name(), e);
            }
        }
        // a cron-fired delete runs cleanup from inside one of these tasks
        let current = tokio::task::try_id();
        for task in lock(&self.tasks).drain(..) {
            if Some(task.id()) != current {
                task.abort();
            }
        }
        tracing::info!("[{}] Supervisor cleaned up", self.server_name());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub fn is_png(bytes: &[u8]) -> bool {
    bytes.starts_with(&PNG_MAGIC)
}

fn cron_entry_from(options: &Map<String, Value>) -> ServerResult<CronEntry> {
    let text = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    };
    let mut args = std::collections::BTreeMap::new();
    for (k, v) in options {
        if let Some(s) = text(v) {
            args.insert(k.clone(), s);
        }
    }
    let source = args
        .remove("source")
        .ok_or_else(|| ServerError::InvalidArgument("cron source missing".into()))?;
    let command = args
        .remove("command")
        .ok_or_else(|| ServerError::InvalidArgument("cron command missing".into()))?;
    args.remove("enabled");
    Ok(CronEntry { source, enabled: false, command, args })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Owner, StaticIdentity};
    use std::path::Path;
    use tokio::sync::broadcast;

    fn current_owner() -> Owner {
        Owner {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    async fn supervisor(base: &Path, name: &str) -> Arc<ServerSupervisor> {
        let owner = current_owner();
        let identity = StaticIdentity::new()
            .with_user(owner.uid, "steve", owner.gid)
            .with_user(owner.uid + 1, "alex", owner.gid + 1)
            .with_group(owner.gid, "steve", &[])
            .with_group(owner.gid + 1, "alex", &[]);
        let server = ManagedServer::new(name, base, Arc::new(identity));
        server.create(owner).await.unwrap();
        ServerSupervisor::new(server, EventBus::new(), SupervisorOptions::default())
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn heartbeat_widens_while_gathering() {
        let base = Duration::from_millis(5000);
        assert_eq!(heartbeat_period(base, false), base);
        assert_eq!(heartbeat_period(base, true), Duration::from_millis(15000));
    }

    #[test]
    fn save_timer_only_restarts_on_change() {
        let parent = CancellationToken::new();
        let mut timer = SaveTimer::default();
        assert!(timer.retarget(None, &parent).is_none());

        let (minutes, first) = timer.retarget(Some(10), &parent).unwrap();
        assert_eq!(minutes, 10);
        assert!(timer.retarget(Some(10), &parent).is_none());
        assert!(!first.is_cancelled());

        let (_, second) = timer.retarget(Some(5), &parent).unwrap();
        assert!(first.is_cancelled());
        assert!(timer.retarget(None, &parent).is_none());
        assert!(second.is_cancelled());
        assert_eq!(timer.applied(), None);
    }

    #[test]
    fn png_magic() {
        assert!(is_png(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a]));
        assert!(!is_png(b"GIF89a"));
    }

    #[tokio::test]
    async fn every_dispatch_acks_and_fins() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "dispatch_ack_fin").await;
        let mut rx = sup.bus.subscribe();

        let notice = sup.dispatch("steve", json!({"command": "fly"})).await;
        assert_eq!(notice.success, Some(false));
        assert_eq!(notice.error.as_deref(), Some("Unknown command 'fly'"));

        let notice = sup
            .dispatch("steve", json!({"command": "modify_sp", "property": "motd", "new_value": "hello"}))
            .await;
        assert_eq!(notice.success, Some(true));
        assert_eq!(sup.server().sp().await.unwrap().get_general("motd"), Some("hello"));

        let names: Vec<&str> = drain(&mut rx).iter().map(Event::name).collect();
        assert_eq!(names, vec!["server_ack", "server_fin", "server_ack", "server_fin"]);
        assert_eq!(sup.notices().len(), 2);
    }

    #[tokio::test]
    async fn non_members_are_refused() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "non_member").await;
        let notice = sup.dispatch("alex", json!({"command": "backup"})).await;
        assert_eq!(notice.success, Some(false));
        assert_eq!(
            notice.error.as_deref(),
            Some("User alex does not have permissions on non_member")
        );
    }

    #[tokio::test]
    async fn chown_may_not_change_the_user() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "chown_guard").await;
        let owner = current_owner();
        let notice = sup
            .dispatch("steve", json!({"command": "chown", "uid": owner.uid + 1, "gid": owner.gid}))
            .await;
        assert_eq!(notice.error.as_deref(), Some("You may not change the user owner of the server."));
    }

    #[tokio::test]
    async fn manage_cron_create_then_start() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "cron_manage").await;

        let hash = sup
            .manage_cron(&json!({"operation": "create", "command": "backup", "source": "0 3 * * *"}))
            .await
            .unwrap();
        assert_eq!(hash.len(), 64);
        let crons = sup.server().crons().await.unwrap();
        assert!(!crons[&hash].enabled);

        sup.manage_cron(&json!({"operation": "start", "hash": hash})).await.unwrap();
        assert!(sup.server().crons().await.unwrap()[&hash].enabled);

        let err = sup.manage_cron(&json!({"operation": "delete", "hash": "nope"})).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn unparsable_cron_is_written_back_disabled() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "cron_unparsable").await;
        sup.start().await;

        let hash = sup
            .manage_cron(&json!({"operation": "create", "command": "backup", "source": "not a cron"}))
            .await
            .unwrap();
        sup.manage_cron(&json!({"operation": "start", "hash": hash})).await.unwrap();

        sup.server().clear_document_cache();
        let crons = sup.server().crons().await.unwrap();
        assert!(!crons[&hash].enabled);
        assert_eq!(sup.cron_job_count().await, 0);
        sup.cleanup().await;
    }

    #[tokio::test]
    async fn cron_firing_records_notice() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "cron_firing").await;
        let mut args = std::collections::BTreeMap::new();
        args.insert("property".to_string(), "difficulty".to_string());
        args.insert("new_value".to_string(), "2".to_string());
        let firing = CronFiring {
            hash: "abc".into(),
            entry: CronEntry {
                source: "* * * * *".into(),
                enabled: true,
                command: "modify_sp".into(),
                args,
            },
        };
        let notice = sup.run_cron(firing).await;
        assert_eq!(notice.success, Some(true));
        assert_eq!(sup.notices().len(), 1);
        assert_eq!(sup.server().sp().await.unwrap().get_general("difficulty"), Some("2"));
    }

    #[tokio::test]
    async fn file_head_for_open_tails_only() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "file_head").await;
        let cwd = sup.server().env.cwd.clone();
        std::fs::write(cwd.join("server.log"), "line one\n").unwrap();
        std::fs::write(cwd.join("big.log"), vec![b'x'; (FILE_HEAD_LIMIT + 1) as usize]).unwrap();
        sup.open_tail("server.log");
        sup.open_tail("big.log");
        let mut rx = sup.bus.subscribe();

        sup.get_file_contents("server.log").await.unwrap();
        sup.get_file_contents("big.log").await.unwrap();
        assert!(matches!(sup.get_file_contents("other.log").await, Err(ServerError::NotFound(_))));

        let heads: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                Event::FileHead { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(heads, vec!["line one\n".to_string(), FILE_TOO_LARGE.to_string()]);
        sup.cleanup().await;
    }

    #[tokio::test]
    async fn glance_page_has_every_key() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "glance").await;
        let mut rx = sup.bus.subscribe();
        sup.get_page_data("glance").await;
        sup.get_page_data("other").await;

        let events = drain(&mut rx);
        match &events[0] {
            Event::PageData { payload: Some(p), .. } => {
                for key in ["increments", "archives", "du_awd", "du_bwd", "du_cwd", "owner", "server_files", "ftb_installer", "eula", "base_dir"] {
                    assert!(p.get(key).is_some(), "missing {}", key);
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&events[1], Event::PageData { payload: None, .. }));
    }

    #[tokio::test]
    async fn down_servers_do_not_announce_or_autostart() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "lan_quiet").await;
        sup.server().modify_sc("minecraft", "broadcast", "true").await.unwrap();
        assert!(sup.broadcast_to_lan().await.is_none());
        assert!(!sup.onreboot_start().await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "cleanup_twice").await;
        sup.start().await;
        assert!(!sup.open_tails().is_empty());
        sup.cleanup().await;
        sup.cleanup().await;
        assert!(sup.is_closed());
        assert!(sup.open_tails().is_empty());
    }

    #[tokio::test]
    async fn tasks_tracked_after_cleanup_are_aborted() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "late_task").await;
        sup.cleanup().await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        sup.track_task(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        // 태스크가 중단되면 sender가 drop됩니다
        let dropped = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap();
        assert!(dropped.is_err());
        assert!(lock(&sup.tasks).is_empty());
    }

    #[tokio::test]
    async fn finished_tasks_are_pruned() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path(), "task_prune").await;
        let done = tokio::spawn(async {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.track_task(done);
        sup.track_task(tokio::spawn(std::future::pending::<()>()));
        assert_eq!(lock(&sup.tasks).len(), 1);
        sup.cleanup().await;
    }
}
