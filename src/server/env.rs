use std::path::{Path, PathBuf};

use serde::Serialize;

/// Subdirectories of the base directory.
pub mod dirs {
    pub const SERVERS: &str = "servers";
    pub const BACKUP: &str = "backup";
    pub const ARCHIVE: &str = "archive";
    pub const PROFILES: &str = "profiles";
    pub const IMPORT: &str = "import";

    pub const ALL: [&str; 5] = [SERVERS, BACKUP, ARCHIVE, PROFILES, IMPORT];
}

pub const SERVER_PROPERTIES: &str = "server.properties";
pub const SERVER_CONFIG: &str = "server.config";
pub const CRON_CONFIG: &str = "cron.config";
pub const EULA: &str = "eula.txt";

/// The three documents every instance carries in its cwd.
pub const CONFIG_FILES: [&str; 3] = [SERVER_PROPERTIES, SERVER_CONFIG, CRON_CONFIG];

/// Paths of one instance, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEnvironment {
    pub server_name: String,
    pub base_dir: PathBuf,
    pub cwd: PathBuf,
    pub backup_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub profile_dir: PathBuf,
    pub properties_path: PathBuf,
    pub config_path: PathBuf,
    pub cron_path: PathBuf,
}

impl ServerEnvironment {
    pub fn new(server_name: &str, base_dir: &Path) -> Self {
        let cwd = base_dir.join(dirs::SERVERS).join(server_name);
        Self {
            server_name: server_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            backup_dir: base_dir.join(dirs::BACKUP).join(server_name),
            archive_dir: base_dir.join(dirs::ARCHIVE).join(server_name),
            profile_dir: base_dir.join(dirs::PROFILES),
            properties_path: cwd.join(SERVER_PROPERTIES),
            config_path: cwd.join(SERVER_CONFIG),
            cron_path: cwd.join(CRON_CONFIG),
            cwd,
        }
    }

    pub fn screen_session(&self) -> String {
        format!("mc-{}", self.server_name)
    }

    pub fn eula_path(&self) -> PathBuf {
        self.cwd.join(EULA)
    }

    pub fn import_dir(&self) -> PathBuf {
        self.base_dir.join(dirs::IMPORT)
    }
}

/// Letters, digits, `_` and `.`, not starting with `.`.
pub fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Instance name owning `path`, if it lies under `<base>/servers/<name>`.
pub fn extract_server_name(base_dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base_dir.join(dirs::SERVERS)).ok()?;
    let name = rel.components().next()?.as_os_str().to_str()?;
    valid_server_name(name).then(|| name.to_string())
}

/// Immediate subdirectories of the servers root.
pub fn server_list(base_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(base_dir.join(dirs::SERVERS))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
