//! The three ini documents of an instance and their mtime-keyed cache.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::error::{ServerError, ServerResult};
use super::ManagedServer;
use crate::config::ini::Section;
use crate::config::IniDocument;
use crate::utils::parse_bool;

/// Defaults written into a fresh `server.properties`.
pub const SP_DEFAULTS: [(&str, &str); 12] = [
    ("server-port", "25565"),
    ("max-players", "20"),
    ("level-seed", ""),
    ("gamemode", "0"),
    ("difficulty", "1"),
    ("level-type", "DEFAULT"),
    ("level-name", "world"),
    ("max-build-height", "256"),
    ("generate-structures", "true"),
    ("generator-settings", ""),
    ("server-ip", "0.0.0.0"),
    ("enable-query", "false"),
];

/// Parsed documents keyed by path, valid while the file's mtime is unchanged.
#[derive(Default)]
pub struct DocumentCache {
    entries: Mutex<HashMap<PathBuf, (SystemTime, IniDocument)>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, (SystemTime, IniDocument)>> {
        // 캐시는 언제든 다시 읽을 수 있으므로 poison 상태여도 그대로 사용
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read `path`. Missing and corrupt files read as empty documents.
    pub async fn read(&self, path: &Path) -> ServerResult<IniDocument> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.invalidate(path);
                return Ok(IniDocument::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = meta.modified()?;

        if let Some((cached_mtime, doc)) = self.lock().get(path) {
            if *cached_mtime == mtime {
                return Ok(doc.clone());
            }
        }

        let bytes = tokio::fs::read(path).await?;
        let doc = match IniDocument::parse_bytes(&bytes) {
            Some(doc) => doc,
            None => {
                let err = ServerError::ConfigCorruption(path.display().to_string());
                tracing::warn!("{}; reading it as empty", err);
                IniDocument::new()
            }
        };
        self.lock().insert(path.to_path_buf(), (mtime, doc.clone()));
        Ok(doc)
    }

    /// Replace the whole document on disk.
    pub async fn write(&self, path: &Path, doc: &IniDocument) -> ServerResult<()> {
        tokio::fs::write(path, doc.to_ini_string()).await?;
        self.invalidate(path);
        Ok(())
    }

    pub fn invalidate(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// One scheduled job from `cron.config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronEntry {
    /// Cron expression.
    pub source: String,
    pub enabled: bool,
    pub command: String,
    /// Remaining named arguments for `command`.
    #[serde(flatten)]
    pub args: BTreeMap<String, String>,
}

pub type CronDocument = BTreeMap<String, CronEntry>;

impl CronEntry {
    pub fn from_section(section: &Section) -> Option<Self> {
        let mut args = section.clone();
        let source = args.remove("source")?;
        let command = args.remove("command")?;
        let enabled = parse_bool(args.remove("enabled").as_deref());
        Some(Self { source, enabled, command, args })
    }

    pub fn to_section(&self) -> Section {
        let mut section = self.args.clone();
        section.insert("source".into(), self.source.clone());
        section.insert("command".into(), self.command.clone());
        section.insert("enabled".into(), self.enabled.to_string());
        section
    }

    /// `{command, ...args}` as an inbound command request.
    pub fn request(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.args {
            map.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        map.insert("command".into(), serde_json::Value::String(self.command.clone()));
        serde_json::Value::Object(map)
    }
}

impl ManagedServer {
    /// `server.properties`; keys live in the general section.
    pub async fn sp(&self) -> ServerResult<IniDocument> {
        self.docs.read(&self.env.properties_path).await
    }

    pub async fn sc(&self) -> ServerResult<IniDocument> {
        self.docs.read(&self.env.config_path).await
    }

    pub async fn crons(&self) -> ServerResult<CronDocument> {
        let doc = self.docs.read(&self.env.cron_path).await?;
        let mut crons = CronDocument::new();
        for (hash, section) in &doc.sections {
            match CronEntry::from_section(section) {
                Some(entry) => {
                    crons.insert(hash.clone(), entry);
                }
                None => tracing::warn!("[{}] Ignoring incomplete cron entry {}", self.server_name, hash),
            }
        }
        Ok(crons)
    }

    pub async fn modify_sp(&self, property: &str, new_value: &str) -> ServerResult<()> {
        let mut doc = self.sp().await?;
        doc.set_general(property, new_value);
        self.docs.write(&self.env.properties_path, &doc).await?;
        tracing::info!("[{}] server.properties: {} = {}", self.server_name, property, new_value);
        Ok(())
    }

    /// Merge `overlay` into `server.properties`, overwriting existing keys.
    pub async fn overlay_sp<'a, I>(&self, overlay: I) -> ServerResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut doc = self.sp().await?;
        for (k, v) in overlay {
            doc.set_general(k, v);
        }
        self.docs.write(&self.env.properties_path, &doc).await
    }

    pub async fn modify_sc(&self, section: &str, property: &str, new_value: &str) -> ServerResult<()> {
        let mut doc = self.sc().await?;
        doc.set(section, property, new_value);
        self.docs.write(&self.env.config_path, &doc).await?;
        tracing::info!("[{}] server.config: [{}] {} = {}", self.server_name, section, property, new_value);
        Ok(())
    }

    /// Store a new cron entry, always disabled until started.
    pub async fn add_cron(&self, hash: &str, entry: &CronEntry) -> ServerResult<()> {
        let mut doc = self.docs.read(&self.env.cron_path).await?;
        let mut entry = entry.clone();
        entry.enabled = false;
        doc.sections.insert(hash.to_string(), entry.to_section());
        self.docs.write(&self.env.cron_path, &doc).await
    }

    pub async fn delete_cron(&self, hash: &str) -> ServerResult<()> {
        let mut doc = self.docs.read(&self.env.cron_path).await?;
        if doc.remove_section(hash).is_none() {
            return Err(ServerError::NotFound(format!("cron {}", hash)));
        }
        self.docs.write(&self.env.cron_path, &doc).await
    }

    pub async fn set_cron(&self, hash: &str, enabled: bool) -> ServerResult<()> {
        let mut doc = self.docs.read(&self.env.cron_path).await?;
        let Some(section) = doc.sections.get_mut(hash) else {
            return Err(ServerError::NotFound(format!("cron {}", hash)));
        };
        section.insert("enabled".into(), enabled.to_string());
        self.docs.write(&self.env.cron_path, &doc).await
    }

    pub fn clear_document_cache(&self) {
        self.docs.clear();
    }
}
