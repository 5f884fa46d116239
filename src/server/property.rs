//! Named facts about an instance, each resolved on its own.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};

use super::commit::WorldConsole;
use super::error::{ServerError, ServerResult};
use super::ManagedServer;
use crate::process_monitor;
use crate::protocol::{ping, query, PingResult};
use crate::utils::{parse_bool, parse_leading_int};

pub const DEFAULT_SERVER_PORT: u16 = 25565;
const LOCALHOST: &str = "127.0.0.1";

const DU_AWD_TIMEOUT: Duration = Duration::from_secs(2);
const DU_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Owner,
    OwnerUid,
    OwnerGid,
    Exists,
    NotExists,
    Up,
    NotUp,
    JavaPid,
    ScreenPid,
    ServerPort,
    ServerIp,
    Memory,
    Ping,
    Query,
    ServerProperties,
    ServerConfig,
    DuAwd,
    DuBwd,
    DuCwd,
    Broadcast,
    OnrebootStart,
    Unconventional,
    CommitInterval,
    Eula,
    ServerFiles,
    Autosave,
    FtbInstaller,
}

impl Property {
    pub const ALL: [Property; 27] = [
        Property::Owner,
        Property::OwnerUid,
        Property::OwnerGid,
        Property::Exists,
        Property::NotExists,
        Property::Up,
        Property::NotUp,
        Property::JavaPid,
        Property::ScreenPid,
        Property::ServerPort,
        Property::ServerIp,
        Property::Memory,
        Property::Ping,
        Property::Query,
        Property::ServerProperties,
        Property::ServerConfig,
        Property::DuAwd,
        Property::DuBwd,
        Property::DuCwd,
        Property::Broadcast,
        Property::OnrebootStart,
        Property::Unconventional,
        Property::CommitInterval,
        Property::Eula,
        Property::ServerFiles,
        Property::Autosave,
        Property::FtbInstaller,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Property::Owner => "owner",
            Property::OwnerUid => "owner_uid",
            Property::OwnerGid => "owner_gid",
            Property::Exists => "exists",
            Property::NotExists => "!exists",
            Property::Up => "up",
            Property::NotUp => "!up",
            Property::JavaPid => "java_pid",
            Property::ScreenPid => "screen_pid",
            Property::ServerPort => "server-port",
            Property::ServerIp => "server-ip",
            Property::Memory => "memory",
            Property::Ping => "ping",
            Property::Query => "query",
            Property::ServerProperties => "server.properties",
            Property::ServerConfig => "server.config",
            Property::DuAwd => "du_awd",
            Property::DuBwd => "du_bwd",
            Property::DuCwd => "du_cwd",
            Property::Broadcast => "broadcast",
            Property::OnrebootStart => "onreboot_start",
            Property::Unconventional => "unconventional",
            Property::CommitInterval => "commit_interval",
            Property::Eula => "eula",
            Property::ServerFiles => "server_files",
            Property::Autosave => "autosave",
            Property::FtbInstaller => "FTBInstall.sh",
        }
    }
}

impl FromStr for Property {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| ServerError::InvalidArgument(format!("unknown property '{}'", s)))
    }
}

fn eula_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)eula\s*=\s*true").ok()).as_ref()
}

pub fn eula_accepted(text: &str) -> bool {
    eula_regex().map(|re| text.lines().any(|l| re.is_match(l))).unwrap_or(false)
}

/// Launchable files: jars, phars and the Cuberite binary.
pub fn is_server_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".jar") || lower.ends_with(".phar") || name == "Cuberite"
}

fn server_files_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|n| is_server_file(n))
        .collect();
    names.sort();
    names
}

/// Allocated bytes under `root`, like `du` without following symlinks.
pub fn disk_usage(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.blocks() * 512)
        .sum()
}

/// Result of `work`, or 0 once `limit` elapses. Late results are discarded.
pub async fn bounded_disk_usage<F>(work: F, limit: Duration) -> u64
where
    F: Future<Output = u64>,
{
    tokio::time::timeout(limit, work).await.unwrap_or(0)
}

async fn du(path: PathBuf, limit: Duration) -> u64 {
    let handle = tokio::task::spawn_blocking(move || disk_usage(&path));
    bounded_disk_usage(async { handle.await.unwrap_or(0) }, limit).await
}

impl ManagedServer {
    /// Resolve one named fact. Failures stay local to the fact asked for.
    pub async fn property(&self, name: &str) -> ServerResult<Value> {
        let property: Property = name.parse()?;
        self.resolve(property).await
    }

    /// Boolean facts usable as `verify` gates.
    pub(crate) async fn gate(&self, property: Property) -> ServerResult<bool> {
        match property {
            Property::Exists => Ok(self.exists().await),
            Property::NotExists => Ok(!self.exists().await),
            Property::Up => Ok(self.is_up().await),
            Property::NotUp => Ok(!self.is_up().await),
            Property::Broadcast => Ok(parse_bool(self.sc().await?.get("minecraft", "broadcast"))),
            Property::OnrebootStart => self.onreboot_enabled().await,
            Property::Unconventional => Ok(parse_bool(self.sc().await?.get("minecraft", "unconventional"))),
            Property::Eula => Ok(self.eula().await? == Some(true)),
            Property::FtbInstaller => Ok(tokio::fs::metadata(self.env.cwd.join("FTBInstall.sh")).await.is_ok()),
            other => Err(ServerError::InvalidArgument(format!("{} is not a boolean property", other.name()))),
        }
    }

    pub async fn resolve(&self, property: Property) -> ServerResult<Value> {
        let value = match property {
            Property::Owner => serde_json::to_value(self.owner_info().await?).unwrap_or(Value::Null),
            Property::OwnerUid => json!(self.owner().await?.uid),
            Property::OwnerGid => json!(self.owner().await?.gid),
            Property::Exists => json!(self.exists().await),
            Property::NotExists => json!(!self.exists().await),
            Property::Up => json!(self.is_up().await),
            Property::NotUp => json!(!self.is_up().await),
            Property::JavaPid => match self.pids().await.and_then(|p| p.java) {
                Some(pid) => json!(pid),
                None => return Err(ServerError::NotFound("java pid".into())),
            },
            Property::ScreenPid => match self.pids().await.and_then(|p| p.screen) {
                Some(pid) => json!(pid),
                None => return Err(ServerError::NotFound("screen pid".into())),
            },
            Property::ServerPort => json!(self.sp().await?.get_general("server-port")),
            Property::ServerIp => json!(self.sp().await?.get_general("server-ip")),
            Property::Memory => json!(self.memory().await?),
            Property::Ping => serde_json::to_value(self.ping().await?).unwrap_or(Value::Null),
            Property::Query => self.query().await,
            Property::ServerProperties => serde_json::to_value(self.sp().await?).unwrap_or(Value::Null),
            Property::ServerConfig => serde_json::to_value(self.sc().await?).unwrap_or(Value::Null),
            Property::DuAwd => json!(du(self.env.archive_dir.clone(), DU_AWD_TIMEOUT).await),
            Property::DuBwd => json!(du(self.env.backup_dir.clone(), DU_TIMEOUT).await),
            Property::DuCwd => json!(du(self.env.cwd.clone(), DU_TIMEOUT).await),
            Property::Broadcast => json!(parse_bool(self.sc().await?.get("minecraft", "broadcast"))),
            Property::OnrebootStart => json!(self.onreboot_enabled().await?),
            Property::Unconventional => json!(parse_bool(self.sc().await?.get("minecraft", "unconventional"))),
            Property::CommitInterval => json!(self.commit_interval().await?),
            Property::Eula => json!(self.eula().await?),
            Property::ServerFiles => json!(self.server_files().await?),
            Property::Autosave => json!(self.probe_autosave().await?),
            Property::FtbInstaller => json!(tokio::fs::metadata(self.env.cwd.join("FTBInstall.sh")).await.is_ok()),
        };
        Ok(value)
    }

    pub async fn server_port(&self) -> ServerResult<u16> {
        Ok(parse_leading_int(self.sp().await?.get_general("server-port"))
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_SERVER_PORT))
    }

    async fn is_phar(&self) -> ServerResult<bool> {
        Ok(self
            .sc()
            .await?
            .get("java", "jarfile")
            .map(|j| j.to_ascii_lowercase().ends_with(".phar"))
            .unwrap_or(false))
    }

    /// `/proc/<java pid>/status` of the running game.
    pub async fn memory(&self) -> ServerResult<HashMap<String, String>> {
        let Some(pid) = self.pids().await.and_then(|p| p.java) else {
            return Err(ServerError::Precondition("up".into()));
        };
        Ok(process_monitor::read_status_async(pid).await?)
    }

    pub async fn ping(&self) -> ServerResult<PingResult> {
        if self.is_phar().await? {
            return Err(ServerError::InvalidArgument("ping is not supported for phar servers".into()));
        }
        if !self.is_up().await {
            return Err(ServerError::Precondition("up".into()));
        }
        let port = self.server_port().await?;
        Ok(ping::ping(LOCALHOST, port).await?)
    }

    /// Full query stat, `{}` whenever it cannot be had.
    pub async fn query(&self) -> Value {
        let jarfile = match self.sc().await {
            Ok(sc) => sc.get("java", "jarfile").map(str::to_ascii_lowercase),
            Err(_) => None,
        };
        match jarfile {
            Some(j) if !j.ends_with(".phar") => {}
            _ => return json!({}),
        }
        let Ok(port) = self.server_port().await else {
            return json!({});
        };
        match query::full_stat(LOCALHOST, port).await {
            Ok(stat) => serde_json::to_value(stat).unwrap_or_else(|_| json!({})),
            Err(e) => {
                tracing::debug!("[{}] query failed: {}", self.server_name, e);
                json!({})
            }
        }
    }

    pub async fn onreboot_enabled(&self) -> ServerResult<bool> {
        Ok(parse_bool(self.sc().await?.get("onreboot", "start")))
    }

    /// Minutes between automatic world commits, if configured.
    pub async fn commit_interval(&self) -> ServerResult<Option<u64>> {
        Ok(parse_leading_int(self.sc().await?.get("minecraft", "commit_interval"))
            .filter(|m| *m > 0)
            .map(|m| m as u64))
    }

    /// `None` when eula.txt is missing.
    pub async fn eula(&self) -> ServerResult<Option<bool>> {
        match tokio::fs::read(self.env.eula_path()).await {
            Ok(bytes) => Ok(Some(eula_accepted(&String::from_utf8_lossy(&bytes)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Launchable files in the cwd, then any new ones from the bound profile.
    pub async fn server_files(&self) -> ServerResult<Vec<String>> {
        let profile = self
            .sc()
            .await?
            .get("minecraft", "profile")
            .filter(|p| !p.is_empty())
            .map(|p| self.env.profile_dir.join(p));
        let cwd = self.env.cwd.clone();

        let files = tokio::task::spawn_blocking(move || {
            let mut files = server_files_in(&cwd);
            if let Some(dir) = profile {
                let seen: BTreeSet<String> = files.iter().cloned().collect();
                files.extend(server_files_in(&dir).into_iter().filter(|f| !seen.contains(f)));
            }
            files
        })
        .await
        .map_err(std::io::Error::other)?;
        Ok(files)
    }
}
