pub mod ini;

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use ini::IniDocument;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mineos.toml";

/// Daemon-wide settings, read once at startup.
#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,
    /// Extra files to tail in every instance, comma separated and relative to its cwd.
    #[serde(default)]
    pub additional_logfiles: Option<String>,
    /// Users allowed to create servers, comma separated. Unset allows everyone.
    #[serde(default)]
    pub creators: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_host_heartbeat_interval_ms")]
    pub host_heartbeat_interval_ms: u64,
    #[serde(default = "default_true")]
    pub lan_broadcast: bool,
    #[serde(default = "default_autostart_delay_secs")]
    pub autostart_delay_secs: u64,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_base_directory() -> PathBuf {
    PathBuf::from("/var/games/minecraft")
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_host_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_autostart_delay_secs() -> u64 {
    5
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            additional_logfiles: None,
            creators: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            host_heartbeat_interval_ms: default_host_heartbeat_interval_ms(),
            lan_broadcast: true,
            autostart_delay_secs: default_autostart_delay_secs(),
            log_file: None,
        }
    }
}

impl DaemonConfig {
    /// `$MINEOS_CONFIG` or [`DEFAULT_CONFIG_PATH`]; a missing file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("MINEOS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => toml::from_str(&s)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
        }
    }

    /// Cleaned `additional_logfiles`: trimmed, normalized, without leading `../`.
    pub fn additional_logfiles(&self) -> Vec<String> {
        self.additional_logfiles
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(normalize_relative)
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn may_create(&self, username: &str) -> bool {
        match self.creators.as_deref() {
            None => true,
            Some(list) if list.trim().is_empty() => true,
            Some(list) => list.split(',').map(str::trim).any(|c| c == username),
        }
    }
}

/// Collapse `.`/`..` segments lexically, dropping any that would climb out.
fn normalize_relative(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.base_directory, PathBuf::from("/var/games/minecraft"));
        assert_eq!(cfg.heartbeat_interval_ms, 5000);
        assert!(cfg.lan_broadcast);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mineos.toml");
        std::fs::write(&path, "base_directory = \"/srv/mc\"\nlan_broadcast = false\n").unwrap();
        let cfg = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(cfg.base_directory, PathBuf::from("/srv/mc"));
        assert!(!cfg.lan_broadcast);
        assert_eq!(cfg.autostart_delay_secs, 5);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mineos.toml");
        std::fs::write(&path, "base_directory = [").unwrap();
        assert!(DaemonConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_additional_logfiles_are_sanitized() {
        let cfg = DaemonConfig {
            additional_logfiles: Some(" logs/debug.log, ,../../etc/passwd,./plugins/x.log ".into()),
            ..Default::default()
        };
        assert_eq!(
            cfg.additional_logfiles(),
            vec!["logs/debug.log", "etc/passwd", "plugins/x.log"]
        );
    }

    #[test]
    fn test_creators_whitelist() {
        let open = DaemonConfig::default();
        assert!(open.may_create("anyone"));

        let closed = DaemonConfig {
            creators: Some("steve, alex".into()),
            ..Default::default()
        };
        assert!(closed.may_create("alex"));
        assert!(!closed.may_create("herobrine"));
    }
}
