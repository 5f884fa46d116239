//! Incremental backups (rdiff-backup) and tarball archives of an instance.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::IniDocument;
use crate::identity::Owner;
use crate::server::env::{ServerEnvironment, SERVER_PROPERTIES};
use crate::server::error::{ServerError, ServerResult};
use crate::utils::{run_capture, run_tool};

const RDIFF: &str = "rdiff-backup";
const TAR: &str = "tar";

/// Subdirectories of the cwd left out of increments.
pub const BACKUP_EXCLUDES: [&str; 1] = ["dynmap"];

/// One row of `--list-increment-sizes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRecord {
    /// Relative restore point, `"0B"` being the current mirror.
    pub step: String,
    pub time: String,
    pub size: String,
    #[serde(rename = "cum")]
    pub cumulative: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub time: DateTime<Utc>,
    pub size: u64,
    pub filename: String,
}

fn increment_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(\w.*?) {3,}(.*?) {2,}([^ ]+ \w*)").ok())
        .as_ref()
}

/// Parse the tabular increment report, numbering rows in report order.
pub fn parse_increments(report: &str) -> Vec<IncrementRecord> {
    let Some(re) = increment_regex() else {
        return Vec::new();
    };
    re.captures_iter(report)
        .enumerate()
        .map(|(i, caps)| IncrementRecord {
            step: format!("{}B", i),
            time: caps[1].trim().to_string(),
            size: caps[2].trim().to_string(),
            cumulative: caps[3].trim().to_string(),
        })
        .collect()
}

// ─── Backup ──────────────────────────────────────────────────

pub struct BackupEngine<'a> {
    env: &'a ServerEnvironment,
}

impl<'a> BackupEngine<'a> {
    pub fn new(env: &'a ServerEnvironment) -> Self {
        Self { env }
    }

    /// Mirror the cwd into the backup store, keeping an increment.
    pub async fn backup(&self, owner: Owner) -> ServerResult<()> {
        let mut args: Vec<String> = Vec::new();
        for dir in BACKUP_EXCLUDES {
            args.push("--exclude".into());
            args.push(self.env.cwd.join(dir).display().to_string());
        }
        args.push(format!("{}/", self.env.cwd.display()));
        args.push(self.env.backup_dir.display().to_string());

        tracing::info!("[{}] Backing up to {}", self.env.server_name, self.env.backup_dir.display());
        run_tool(RDIFF, &args, &self.env.backup_dir, Some(owner)).await
    }

    pub async fn restore(&self, step: &str, owner: Owner) -> ServerResult<()> {
        let args = [
            "--restore-as-of".to_string(),
            step.to_string(),
            "--force".to_string(),
            self.env.backup_dir.display().to_string(),
            self.env.cwd.display().to_string(),
        ];
        tracing::info!("[{}] Restoring as of {}", self.env.server_name, step);
        run_tool(RDIFF, &args, &self.env.backup_dir, Some(owner)).await
    }

    /// Fails, rather than returning an empty list, when there is no backup store.
    pub async fn list_increments(&self) -> ServerResult<Vec<IncrementRecord>> {
        let dir = self.env.backup_dir.display().to_string();
        let cwd = if self.env.backup_dir.is_dir() {
            self.env.backup_dir.clone()
        } else {
            self.env.base_dir.clone()
        };
        let output = run_capture(RDIFF, ["--list-increment-sizes", dir.as_str()], &cwd, None).await?;
        if !output.status.success() {
            return Err(ServerError::tool(RDIFF, format!("{} is not a backup store ({})", dir, output.status)));
        }
        Ok(parse_increments(&output.stdout))
    }

    /// Remove increments older than `step` (e.g. `"7D"`, `"5B"`).
    pub async fn prune(&self, step: &str) -> ServerResult<()> {
        let args = [
            "--force".to_string(),
            "--remove-older-than".to_string(),
            step.to_string(),
            self.env.backup_dir.display().to_string(),
        ];
        tracing::info!("[{}] Pruning increments older than {}", self.env.server_name, step);
        run_tool(RDIFF, &args, &self.env.backup_dir, None).await
    }

    /// Contents of one backed up file as it was at `restore_as_of`.
    pub async fn previous_version(&self, filepath: &str, restore_as_of: &str) -> ServerResult<String> {
        let source = self.env.backup_dir.join(filepath.trim_start_matches('/'));
        let tmp = tempfile::NamedTempFile::new()?;
        let args = [
            "--force".to_string(),
            "--restore-as-of".to_string(),
            restore_as_of.to_string(),
            source.display().to_string(),
            tmp.path().display().to_string(),
        ];
        run_tool(RDIFF, &args, &self.env.backup_dir, None).await?;
        let bytes = tokio::fs::read(tmp.path()).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn previous_property(&self, restore_as_of: &str) -> ServerResult<IniDocument> {
        let text = self.previous_version(SERVER_PROPERTIES, restore_as_of).await?;
        Ok(IniDocument::parse(&text))
    }
}

// ─── Archive ─────────────────────────────────────────────────

pub struct ArchiveEngine<'a> {
    env: &'a ServerEnvironment,
}

impl<'a> ArchiveEngine<'a> {
    pub fn new(env: &'a ServerEnvironment) -> Self {
        Self { env }
    }

    pub fn archive_filename(&self, at: DateTime<Local>) -> String {
        format!("server-{}_{}.tgz", self.env.server_name, at.format("%Y-%m-%d_%H:%M:%S"))
    }

    /// Tar the whole cwd into one timestamped `.tgz` in the archive dir.
    pub async fn archive(&self, owner: Owner) -> ServerResult<PathBuf> {
        let target = self.env.archive_dir.join(self.archive_filename(Local::now()));
        let target_arg = target.display().to_string();
        tracing::info!("[{}] Archiving to {}", self.env.server_name, target_arg);
        run_tool(TAR, ["czf", target_arg.as_str(), "."], &self.env.cwd, Some(owner)).await?;
        Ok(target)
    }

    /// Archive files, newest first.
    pub async fn list_archives(&self) -> ServerResult<Vec<ArchiveRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.env.archive_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let Some(filename) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            records.push(ArchiveRecord {
                time: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                size: meta.len(),
                filename,
            });
        }
        records.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(records)
    }

    pub async fn delete_archive(&self, filename: &str) -> ServerResult<()> {
        let path = plain_child(&self.env.archive_dir, filename)?;
        tokio::fs::remove_file(&path).await?;
        tracing::info!("[{}] Deleted archive {}", self.env.server_name, filename);
        Ok(())
    }
}

/// `dir/name`, refusing anything that is not a bare file name.
fn plain_child(dir: &Path, name: &str) -> ServerResult<PathBuf> {
    let bare = Path::new(name)
        .file_name()
        .map(|f| f == std::ffi::OsStr::new(name))
        .unwrap_or(false);
    if !bare {
        return Err(ServerError::InvalidArgument(format!("'{}' is not a plain file name", name)));
    }
    Ok(dir.join(name))
}
