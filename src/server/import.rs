//! Creating an instance from a zip or tar archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::env::{ServerEnvironment, CONFIG_FILES};
use super::error::{ServerError, ServerResult};
use super::ManagedServer;
use crate::identity::Owner;
use crate::utils::run_tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
}

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar") || name.ends_with(".tgz") || name.ends_with(".tar.gz") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// A bare file name refers to the shared import directory.
pub fn resolve_archive_path(env: &ServerEnvironment, filepath: &str) -> PathBuf {
    if filepath.contains('/') {
        PathBuf::from(filepath)
    } else {
        env.import_dir().join(filepath)
    }
}

/// The one directory that wraps everything else in `dir`, ignoring the
/// three config files an empty instance starts with.
fn single_wrapper(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut others = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if CONFIG_FILES.iter().any(|f| name == *f) {
            continue;
        }
        others.push(entry);
    }
    if others.len() != 1 {
        return Ok(None);
    }
    let only = &others[0];
    Ok(only.file_type()?.is_dir().then(|| only.path()))
}

/// Move the contents of a lone wrapping directory up into `dir`.
pub fn hoist_single_wrapper(dir: &Path) -> io::Result<bool> {
    let Some(wrapper) = single_wrapper(dir)? else {
        return Ok(false);
    };
    // wrapper 안에 같은 이름의 항목이 있을 수 있으므로 먼저 임시 이름으로 옮김
    let staging = dir.join(format!(".hoist-{}", crate::utils::now_millis()));
    fs::rename(&wrapper, &staging)?;
    for entry in fs::read_dir(&staging)? {
        let entry = entry?;
        fs::rename(entry.path(), dir.join(entry.file_name()))?;
    }
    fs::remove_dir(&staging)?;
    Ok(true)
}

fn extract_zip(archive: &Path, dest: &Path) -> ServerResult<()> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ServerError::tool("unzip", e.to_string()))?;
    zip.extract(dest).map_err(|e| ServerError::tool("unzip", e.to_string()))
}

impl ManagedServer {
    /// `create`, then unpack `filepath` into the new cwd.
    pub async fn create_from_archive(&self, owner: Owner, filepath: &str) -> ServerResult<()> {
        let archive = resolve_archive_path(&self.env, filepath);
        let Some(kind) = ArchiveKind::from_path(&archive) else {
            return Err(ServerError::InvalidArgument(format!(
                "{} is not a zip or tar archive",
                archive.display()
            )));
        };
        if !archive.is_file() {
            return Err(ServerError::NotFound(archive.display().to_string()));
        }

        self.create(owner).await?;
        tracing::info!("[{}] Extracting {}", self.server_name, archive.display());

        match kind {
            ArchiveKind::Zip => {
                let dest = self.env.cwd.clone();
                tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
                    .await
                    .map_err(|e| ServerError::tool("unzip", e.to_string()))??;
            }
            ArchiveKind::Tar => {
                let arg = archive.display().to_string();
                run_tool("tar", ["-xf", arg.as_str()], &self.env.cwd, Some(owner)).await?;
            }
        }

        let cwd = self.env.cwd.clone();
        let hoisted = tokio::task::spawn_blocking(move || hoist_single_wrapper(&cwd))
            .await
            .map_err(io::Error::other)??;
        if hoisted {
            tracing::info!("[{}] Hoisted archive contents out of wrapper directory", self.server_name);
        }
        self.docs.clear();
        self.chown_trees(owner).await
    }
}
