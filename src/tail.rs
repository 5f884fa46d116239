//! Line-by-line follower for one log file that may not exist yet.
//!
//! An existing file is followed from its end. A missing one is waited for
//! with a filesystem watch; once it shows up the watch is dropped and the new
//! file is followed from its first byte. Only directories on the way to the
//! file are watched, so world and plugin data trees are never traversed.

use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Absent,
    /// File missing; waiting for it to be created.
    Watching,
    Tailing,
    /// Cancelled, or failed with something other than not-found.
    Closed,
}

pub struct TailWatcher {
    rel_path: String,
    abs_path: PathBuf,
    state: watch::Receiver<TailState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TailWatcher {
    /// Start following `cwd/rel_path`; each complete line is sent on `lines`.
    pub fn spawn(cwd: &Path, rel_path: &str, lines: mpsc::UnboundedSender<String>) -> Self {
        let abs_path = cwd.join(rel_path);
        let (state_tx, state_rx) = watch::channel(TailState::Absent);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(abs_path.clone(), lines, state_tx, cancel.clone()));

        Self {
            rel_path: rel_path.to_string(),
            abs_path,
            state: state_rx,
            cancel,
            task,
        }
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    pub fn abs_path(&self) -> &Path {
        &self.abs_path
    }

    pub fn state(&self) -> TailState {
        *self.state.borrow()
    }

    /// Resolves once the file is being followed (`true`) or the tail closed (`false`).
    pub async fn wait_for_tailing(&self) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| matches!(s, TailState::Tailing | TailState::Closed))
            .await
            .map(|s| *s == TailState::Tailing)
            .unwrap_or(false)
    }

    pub async fn wait_for_state(&self, wanted: TailState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == wanted || *s == TailState::Closed)
            .await
            .map(|s| *s == wanted)
            .unwrap_or(false)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TailWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    path: PathBuf,
    lines: mpsc::UnboundedSender<String>,
    state: watch::Sender<TailState>,
    cancel: CancellationToken,
) {
    let mut from_start = false;
    loop {
        match File::open(&path).await {
            Ok(file) => {
                if let Err(e) = follow(&path, file, from_start, &lines, &state, &cancel).await {
                    tracing::error!("Tail on {} failed: {}", path.display(), e);
                }
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                state.send_replace(TailState::Watching);
                tracing::info!("Watching for file generation: {}", path.display());
                match wait_for_creation(&path, &cancel).await {
                    Ok(true) => {
                        tracing::info!("{} created, promoting to tail", path.display());
                        from_start = true;
                    }
                    Ok(false) => break,
                    Err(e) => {
                        tracing::error!("Cannot watch for {}: {}", path.display(), e);
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Create tail on {} failed: {}", path.display(), e);
                break;
            }
        }
    }
    state.send_replace(TailState::Closed);
}

async fn follow(
    path: &Path,
    mut file: File,
    from_start: bool,
    lines: &mpsc::UnboundedSender<String>,
    state: &watch::Sender<TailState>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut inode = file.metadata().await?.ino();
    let mut offset = if from_start {
        0
    } else {
        file.seek(SeekFrom::End(0)).await?
    };
    state.send_replace(TailState::Tailing);
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 8192];

    loop {
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            offset += n as u64;
            pending.extend_from_slice(&buf[..n]);
        }

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            if lines.send(line).is_err() {
                return Ok(());
            }
        }

        // rotation (new inode) or truncation (shorter than what we've read)
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.ino() != inode => {
                // the old file is finished; its unterminated last line still counts
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).trim_end_matches('\r').to_string();
                    pending.clear();
                    if lines.send(line).is_err() {
                        return Ok(());
                    }
                }
                file = File::open(path).await?;
                inode = meta.ino();
                offset = 0;
            }
            Ok(meta) if meta.len() < offset => {
                if !pending.is_empty() {
                    tracing::debug!("{}: truncated, dropping {} unterminated bytes", path.display(), pending.len());
                }
                offset = file.seek(SeekFrom::Start(0)).await?;
                pending.clear();
            }
            _ => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Deepest directory on the way to `path` that currently exists.
fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors().skip(1).find(|p| p.is_dir()).map(Path::to_path_buf)
}

/// `Ok(true)` once `path` exists, `Ok(false)` if cancelled first.
async fn wait_for_creation(path: &Path, cancel: &CancellationToken) -> notify::Result<bool> {
    loop {
        if path.exists() {
            return Ok(true);
        }
        let Some(anchor) = nearest_existing_ancestor(path) else {
            return Ok(false);
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&anchor, RecursiveMode::NonRecursive)?;

        // created between the open attempt and the watch
        if path.exists() {
            return Ok(true);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                event = rx.recv() => match event {
                    Some(Ok(_)) => {
                        if path.exists() {
                            return Ok(true);
                        }
                        if nearest_existing_ancestor(path).as_deref() != Some(anchor.as_path()) {
                            // an intermediate directory appeared (or vanished); re-anchor
                            break;
                        }
                    }
                    Some(Err(e)) => tracing::warn!("Watch error on {}: {}", anchor.display(), e),
                    None => return Ok(false),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn existing_file_is_followed_from_end() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "old line\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(dir.path(), "server.log", tx);
        assert!(timeout(WAIT, tail.wait_for_tailing()).await.unwrap());

        append(&log, "first\nsecond\r\n");
        assert_eq!(next_line(&mut rx).await, "first");
        assert_eq!(next_line(&mut rx).await, "second");
    }

    #[tokio::test]
    async fn partial_lines_wait_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(dir.path(), "server.log", tx);
        assert!(timeout(WAIT, tail.wait_for_tailing()).await.unwrap());

        append(&log, "hal");
        tokio::time::sleep(POLL_INTERVAL * 3).await;
        assert!(rx.try_recv().is_err());
        append(&log, "f\n");
        assert_eq!(next_line(&mut rx).await, "half");
    }

    #[tokio::test]
    async fn missing_file_promotes_once_created() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(dir.path(), "logs/latest.log", tx);
        assert!(timeout(WAIT, tail.wait_for_state(TailState::Watching)).await.unwrap());

        std::fs::create_dir(dir.path().join("logs")).unwrap();
        append(&dir.path().join("logs/latest.log"), "[Server thread/INFO]: Starting\n");
        assert!(timeout(WAIT, tail.wait_for_tailing()).await.unwrap());
        assert_eq!(tail.state(), TailState::Tailing);

        append(&dir.path().join("logs/latest.log"), "a\nb\n");
        assert_eq!(next_line(&mut rx).await, "[Server thread/INFO]: Starting");
        assert_eq!(next_line(&mut rx).await, "a");
        assert_eq!(next_line(&mut rx).await, "b");
        tokio::time::sleep(POLL_INTERVAL * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn truncation_restarts_from_top() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proxy.log.0");
        append(&log, "xxxxxxxxxxxxxxxxxxxx\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(dir.path(), "proxy.log.0", tx);
        assert!(timeout(WAIT, tail.wait_for_tailing()).await.unwrap());

        std::fs::write(&log, "").unwrap();
        tokio::time::sleep(POLL_INTERVAL * 3).await;
        append(&log, "fresh\n");
        assert_eq!(next_line(&mut rx).await, "fresh");
    }

    #[tokio::test]
    async fn rotation_keeps_unterminated_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(dir.path(), "server.log", tx);
        assert!(timeout(WAIT, tail.wait_for_tailing()).await.unwrap());

        append(&log, "done\nlast words");
        assert_eq!(next_line(&mut rx).await, "done");
        tokio::time::sleep(POLL_INTERVAL * 3).await;

        std::fs::rename(&log, dir.path().join("server.log.1")).unwrap();
        append(&log, "new file\n");
        assert_eq!(next_line(&mut rx).await, "last words");
        assert_eq!(next_line(&mut rx).await, "new file");
    }

    #[tokio::test]
    async fn close_ends_task() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(dir.path(), "never.log", tx);
        assert!(timeout(WAIT, tail.wait_for_state(TailState::Watching)).await.unwrap());
        tail.close();
        assert!(!timeout(WAIT, tail.wait_for_tailing()).await.unwrap());
        assert_eq!(tail.state(), TailState::Closed);
    }
}
