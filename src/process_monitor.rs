//! Correlates live processes with instance names.
//!
//! Nothing is cached: every call walks the proc mount again, so "up" always
//! reflects the process table at the moment of the question.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Probed in order; the first containing `uptime` wins.
const PROC_MOUNTS: [&str; 4] = ["/usr/compat/linux/proc", "/system/lxproc", "/proc", "/compat/linux/proc"];

/// Pids belonging to one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPids {
    /// The detached `screen -S mc-<name>` session.
    pub screen: Option<u32>,
    /// The game process running inside that session.
    pub java: Option<u32>,
}

pub type ProcessSnapshot = HashMap<String, ServerPids>;

fn screen_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)screen[^S]+S mc-(\S+)").ok()).as_ref()
}

fn java_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.mc-(\S+)").ok()).as_ref()
}

/// Proc mount in use on this host, if any.
pub fn proc_path() -> Option<&'static Path> {
    static PROC: OnceLock<Option<PathBuf>> = OnceLock::new();
    PROC.get_or_init(|| {
        PROC_MOUNTS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.join("uptime").exists())
    })
    .as_deref()
}

/// NUL separated proc file as one space separated line.
fn read_joined(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).replace('\0', " "))
}

/// Walk `proc_root` and collect every instance with a screen or java pid.
pub fn scan(proc_root: &Path) -> ProcessSnapshot {
    let mut snapshot = ProcessSnapshot::new();
    let entries = match std::fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read {}: {}", proc_root.display(), e);
            return snapshot;
        }
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let dir = entry.path();

        // 프로세스가 스캔 도중 종료될 수 있으므로 읽기 실패는 건너뜀
        if let Some(cmdline) = read_joined(&dir.join("cmdline")) {
            if let Some(caps) = screen_regex().and_then(|re| re.captures(&cmdline)) {
                snapshot.entry(caps[1].to_string()).or_default().screen = Some(pid);
                continue;
            }
        }
        if let Some(environ) = read_joined(&dir.join("environ")) {
            if let Some(caps) = java_regex().and_then(|re| re.captures(&environ)) {
                snapshot.entry(caps[1].to_string()).or_default().java = Some(pid);
            }
        }
    }
    snapshot
}

/// Fresh snapshot from the host proc mount.
pub fn server_pids_up() -> ProcessSnapshot {
    match proc_path() {
        Some(root) => scan(root),
        None => {
            tracing::warn!("No proc filesystem found; every server reports down");
            ProcessSnapshot::new()
        }
    }
}

pub fn server_list_up() -> Vec<String> {
    let mut names: Vec<String> = server_pids_up().into_keys().collect();
    names.sort();
    names
}

/// `/proc/<pid>/status` as key/value pairs (`VmRSS` -> `"123456 kB"`).
pub fn read_status(pid: u32) -> std::io::Result<HashMap<String, String>> {
    let root = proc_path().unwrap_or(Path::new("/proc"));
    let text = std::fs::read_to_string(root.join(pid.to_string()).join("status"))?;
    Ok(parse_status(&text))
}

fn parse_status(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

// ── Async wrappers ─────────────────────────────────────────
// proc 스캔은 동기 파일 I/O이므로 spawn_blocking으로 런타임 블로킹을 피합니다.

/// `server_pids_up`의 비동기 래퍼.
pub async fn server_pids_up_async() -> ProcessSnapshot {
    tokio::task::spawn_blocking(server_pids_up)
        .await
        .unwrap_or_default()
}

/// Pids for one instance, if it is up.
pub async fn pids_for(server_name: &str) -> Option<ServerPids> {
    server_pids_up_async().await.remove(server_name)
}

pub async fn read_status_async(pid: u32) -> std::io::Result<HashMap<String, String>> {
    tokio::task::spawn_blocking(move || read_status(pid))
        .await
        .map_err(std::io::Error::other)?
}
