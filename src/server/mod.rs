//! One Minecraft server instance on disk and the operations acting on it.
//!
//! A `ManagedServer` is only path math plus a document cache; every question
//! about liveness goes back to the process table.

pub mod commit;
pub mod documents;
pub mod env;
pub mod error;
pub mod import;
pub mod launch;
pub mod profile;
pub mod property;
pub mod state_machine;

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{fchownat, FchownatFlags, Gid, Pid, Uid};

pub use documents::{CronDocument, CronEntry, DocumentCache, SP_DEFAULTS};
pub use env::ServerEnvironment;
pub use error::{ServerError, ServerResult};
pub use state_machine::{State, Transition};

use crate::backup::{ArchiveEngine, ArchiveRecord, BackupEngine, IncrementRecord};
use crate::config::IniDocument;
use crate::identity::{IdentityProvider, Owner, OwnerInfo};
use crate::process_monitor::{self, ServerPids};
use crate::utils::run_tool;
use property::Property;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STOP_MAX_ITERATIONS: u32 = 150;
const POST_START_SETTLE: Duration = Duration::from_millis(100);
const SAVEALL_FALLBACK_SECS: u64 = 5;

pub struct ManagedServer {
    pub server_name: String,
    pub env: ServerEnvironment,
    docs: DocumentCache,
    identity: Arc<dyn IdentityProvider>,
}

impl ManagedServer {
    pub fn new(server_name: &str, base_dir: &Path, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            server_name: server_name.to_string(),
            env: ServerEnvironment::new(server_name, base_dir),
            docs: DocumentCache::new(),
            identity,
        }
    }

    pub fn identity(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    // ─── Liveness & ownership ──────────────────────────────

    pub async fn pids(&self) -> Option<ServerPids> {
        process_monitor::pids_for(&self.server_name).await
    }

    pub async fn is_up(&self) -> bool {
        self.pids().await.is_some()
    }

    /// An instance exists once its `server.properties` does.
    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.env.properties_path).await.is_ok()
    }

    pub async fn state(&self) -> State {
        State::observe(self.exists().await, self.is_up().await)
    }

    /// Owner of the cwd, which every spawned tool runs as.
    pub async fn owner(&self) -> ServerResult<Owner> {
        let meta = tokio::fs::metadata(&self.env.cwd).await?;
        Ok(Owner { uid: meta.uid(), gid: meta.gid() })
    }

    pub async fn owner_info(&self) -> ServerResult<OwnerInfo> {
        Ok(self.identity.owner_info(self.owner().await?))
    }

    /// Fail with the test's name unless the boolean property holds.
    pub async fn verify(&self, test: &str) -> ServerResult<()> {
        let property: Property = test.parse()?;
        if self.gate(property).await? {
            Ok(())
        } else {
            Err(ServerError::Precondition(test.to_string()))
        }
    }

    async fn require(&self, transition: Transition) -> ServerResult<()> {
        for test in transition.guards() {
            self.verify(test).await?;
        }
        Ok(())
    }

    // ─── Creation & removal ────────────────────────────────

    async fn provision(&self, owner: Owner) -> ServerResult<()> {
        for dir in [&self.env.cwd, &self.env.backup_dir, &self.env.archive_dir] {
            tokio::fs::create_dir_all(dir).await?;
            chown_path(dir, owner)?;
        }
        for file in [&self.env.properties_path, &self.env.config_path, &self.env.cron_path] {
            tokio::fs::OpenOptions::new().create(true).append(true).open(file).await?;
            chown_path(file, owner)?;
        }
        self.docs.clear();
        Ok(())
    }

    pub async fn create(&self, owner: Owner) -> ServerResult<()> {
        self.identity.verify_ids(owner.uid, owner.gid)?;
        self.require(Transition::Create).await?;
        self.provision(owner).await?;

        self.overlay_sp(SP_DEFAULTS.iter().copied()).await?;
        self.modify_sc("java", "java_binary", "").await?;
        self.modify_sc("java", "java_xmx", "256").await?;
        self.modify_sc("onreboot", "start", "false").await?;
        tracing::info!("[{}] Created server owned by {}:{}", self.server_name, owner.uid, owner.gid);
        Ok(())
    }

    /// `create` without vanilla defaults, for proxies and other non-game jars.
    pub async fn create_unconventional_server(&self, owner: Owner) -> ServerResult<()> {
        self.identity.verify_ids(owner.uid, owner.gid)?;
        self.require(Transition::Create).await?;
        self.provision(owner).await?;
        self.modify_sc("minecraft", "unconventional", "true").await?;
        tracing::info!("[{}] Created unconventional server", self.server_name);
        Ok(())
    }

    pub async fn delete(&self) -> ServerResult<()> {
        self.require(Transition::Delete).await?;
        tokio::fs::remove_dir_all(&self.env.cwd).await?;
        for dir in [&self.env.backup_dir, &self.env.archive_dir] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.docs.clear();
        tracing::info!("[{}] Deleted server", self.server_name);
        Ok(())
    }

    // ─── Lifecycle ─────────────────────────────────────────

    /// Spawn the detached screen session. Returns once `screen` has forked off,
    /// not when the game is ready.
    pub async fn start(&self) -> ServerResult<()> {
        self.require(Transition::Start).await?;
        let owner = self.owner().await?;
        let sc = self.sc().await?;
        let plan = launch::start_args(&sc, &self.env.cwd)?;

        if let Some(name) = sc.get("minecraft", "profile").filter(|p| !p.is_empty()) {
            match profile::profile_delta(&self.env, name).await? {
                Some(changed) if !changed.is_empty() => {
                    let info = self.identity.owner_info(owner);
                    profile::copy_profile(&self.env, name, &info).await?;
                }
                Some(_) => {}
                None => tracing::warn!("[{}] Profile {} is missing; starting without it", self.server_name, name),
            }
        }

        let argv = plan.screen_args(&self.env.screen_session());
        tracing::info!("[{}] Starting: {} {}", self.server_name, plan.program, plan.args.join(" "));
        let result = run_tool("screen", &argv, &self.env.cwd, Some(owner)).await;
        tokio::time::sleep(POST_START_SETTLE).await;
        result
    }

    /// Ask the game to stop and wait for it to leave the process table.
    pub async fn stop(&self) -> ServerResult<()> {
        self.require(Transition::Stop).await?;
        self.stuff("stop").await?;
        self.await_exit().await
    }

    /// SIGKILL the game process. The only forced termination there is.
    pub async fn kill(&self) -> ServerResult<()> {
        self.require(Transition::Kill).await?;
        let Some(pid) = self.pids().await.and_then(|p| p.java) else {
            return Err(ServerError::NotFound(format!("java process of {}", self.server_name)));
        };
        tracing::warn!("[{}] Killing java pid {}", self.server_name, pid);
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(std::io::Error::from)?;
        self.await_exit().await
    }

    async fn await_exit(&self) -> ServerResult<()> {
        for _ in 0..STOP_MAX_ITERATIONS {
            if !self.is_up().await {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        if self.is_up().await {
            Err(ServerError::Timeout("stop did not succeed".into()))
        } else {
            Ok(())
        }
    }

    pub async fn restart(&self) -> ServerResult<()> {
        self.require(Transition::Restart).await?;
        self.stop().await?;
        self.start().await
    }

    pub async fn stop_and_backup(&self) -> ServerResult<()> {
        self.stop().await?;
        self.backup().await
    }

    // ─── Console ───────────────────────────────────────────

    /// Type `msg` into window 0 of the screen session.
    pub async fn stuff(&self, msg: &str) -> ServerResult<()> {
        self.verify("exists").await?;
        self.verify("up").await?;
        let owner = self.owner().await?;
        let session = self.env.screen_session();
        let eval = stuff_command(msg);
        run_tool(
            "screen",
            ["-S", session.as_str(), "-p", "0", "-X", "eval", eval.as_str()],
            &self.env.cwd,
            Some(owner),
        )
        .await
    }

    /// `save-all`, then give the game `seconds_delay` (default 5) to finish.
    pub async fn saveall(&self, seconds_delay: Option<u64>) -> ServerResult<()> {
        self.stuff("save-all").await?;
        let secs = seconds_delay.filter(|s| *s > 0).unwrap_or(SAVEALL_FALLBACK_SECS);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(())
    }

    // ─── Backups & archives ────────────────────────────────

    /// Create missing backup/archive dirs with the cwd's ownership.
    async fn provision_stores(&self, owner: Owner) -> ServerResult<()> {
        for dir in [&self.env.backup_dir, &self.env.archive_dir] {
            if !dir.is_dir() {
                tokio::fs::create_dir_all(dir).await?;
                chown_path(dir, owner)?;
            }
        }
        Ok(())
    }

    pub async fn backup(&self) -> ServerResult<()> {
        let owner = self.owner().await?;
        self.provision_stores(owner).await?;
        BackupEngine::new(&self.env).backup(owner).await
    }

    pub async fn restore(&self, step: &str) -> ServerResult<()> {
        let owner = self.owner().await?;
        BackupEngine::new(&self.env).restore(step, owner).await?;
        self.docs.clear();
        Ok(())
    }

    pub async fn list_increments(&self) -> ServerResult<Vec<IncrementRecord>> {
        BackupEngine::new(&self.env).list_increments().await
    }

    pub async fn prune(&self, step: &str) -> ServerResult<()> {
        BackupEngine::new(&self.env).prune(step).await
    }

    pub async fn previous_version(&self, filepath: &str, restore_as_of: &str) -> ServerResult<String> {
        BackupEngine::new(&self.env).previous_version(filepath, restore_as_of).await
    }

    pub async fn previous_property(&self, restore_as_of: &str) -> ServerResult<IniDocument> {
        BackupEngine::new(&self.env).previous_property(restore_as_of).await
    }

    pub async fn archive(&self) -> ServerResult<PathBuf> {
        let owner = self.owner().await?;
        self.provision_stores(owner).await?;
        ArchiveEngine::new(&self.env).archive(owner).await
    }

    pub async fn list_archives(&self) -> ServerResult<Vec<ArchiveRecord>> {
        ArchiveEngine::new(&self.env).list_archives().await
    }

    pub async fn delete_archive(&self, filename: &str) -> ServerResult<()> {
        ArchiveEngine::new(&self.env).delete_archive(filename).await
    }

    // ─── Maintenance ───────────────────────────────────────

    pub async fn accept_eula(&self) -> ServerResult<()> {
        let owner = self.owner().await?;
        let path = self.env.eula_path();
        tokio::fs::write(&path, "eula=true\n").await?;
        chown_path(&path, owner)?;
        tracing::info!("[{}] EULA accepted", self.server_name);
        Ok(())
    }

    pub async fn chown(&self, uid: u32, gid: u32) -> ServerResult<()> {
        self.identity.verify_ids(uid, gid)?;
        self.verify("exists").await?;
        self.chown_trees(Owner { uid, gid }).await?;
        tracing::info!("[{}] Ownership changed to {}:{}", self.server_name, uid, gid);
        Ok(())
    }

    /// Reapply the cwd's owner to the backup and archive trees.
    pub async fn sync_chown(&self) -> ServerResult<()> {
        let owner = self.owner().await?;
        for dir in [&self.env.backup_dir, &self.env.archive_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.chown_trees(owner).await
    }

    /// Recursive chown of the cwd, backup and archive trees.
    pub(crate) async fn chown_trees(&self, owner: Owner) -> ServerResult<()> {
        let roots = vec![
            self.env.cwd.clone(),
            self.env.backup_dir.clone(),
            self.env.archive_dir.clone(),
        ];
        tokio::task::spawn_blocking(move || -> ServerResult<()> {
            for root in roots.iter().filter(|r| r.exists()) {
                chown_recursive(root, owner)?;
            }
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)?
    }

    /// Run a modpack's `FTBInstall.sh` as the owner.
    pub async fn run_installer(&self) -> ServerResult<()> {
        self.verify("exists").await?;
        self.verify("!up").await?;
        let owner = self.owner().await?;
        tracing::info!("[{}] Running FTBInstall.sh", self.server_name);
        run_tool("sh", ["FTBInstall.sh"], &self.env.cwd, Some(owner)).await
    }

    pub async fn renice(&self, niceness: i32) -> ServerResult<()> {
        self.verify("up").await?;
        let Some(pid) = self.pids().await.and_then(|p| p.java) else {
            return Err(ServerError::NotFound(format!("java process of {}", self.server_name)));
        };
        let n = niceness.to_string();
        let p = pid.to_string();
        run_tool("renice", ["-n", n.as_str(), "-p", p.as_str()], &self.env.cwd, None).await
    }
}

/// screen `eval` argument typing `msg` followed by carriage return.
pub fn stuff_command(msg: &str) -> String {
    let escaped = msg.replace('\\', "\\\\").replace('"', "\\\"");
    format!("stuff \"{}\\015\"", escaped)
}

fn chown_path(path: &Path, owner: Owner) -> ServerResult<()> {
    fchownat(
        None,
        path,
        Some(Uid::from_raw(owner.uid)),
        Some(Gid::from_raw(owner.gid)),
        FchownatFlags::NoFollowSymlink,
    )
    .map_err(|e| ServerError::Ownership(format!("chown {}: {}", path.display(), e)))
}

fn chown_recursive(root: &Path, owner: Owner) -> ServerResult<()> {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| ServerError::Ownership(e.to_string()))?;
        chown_path(entry.path(), owner)?;
    }
    Ok(())
}
