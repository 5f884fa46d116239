//! World commits: forcing a save through the console and watching the log
//! for the game's acknowledgement.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use super::error::{ServerError, ServerResult};
use super::ManagedServer;
use crate::tail::TailWatcher;

pub const LATEST_LOG: &str = "logs/latest.log";

const AUTOSAVE_PROBE: Duration = Duration::from_secs(2);
const SAVEALL_WAIT: Duration = Duration::from_secs(10);
const TAIL_SETTLE: Duration = Duration::from_millis(500);

const SAVED_THE_WORLD: &str = "INFO]: Saved the world";
const AUTOSAVE_WAS_ON: &str = "INFO]: Saving is already turned on";
const AUTOSAVE_WAS_OFF: &str = "INFO]: Turned on world auto-saving";

/// The console and archive operations a world commit is built from.
#[allow(async_fn_in_trait)]
pub trait WorldConsole {
    /// Whether world auto-saving is currently on.
    async fn probe_autosave(&self) -> ServerResult<bool>;
    async fn send_console(&self, msg: &str) -> ServerResult<()>;
    /// Force a save and wait until the game reports it done.
    async fn save_and_wait(&self) -> ServerResult<()>;
    async fn archive_world(&self) -> ServerResult<PathBuf>;
}

/// Suspend autosave, force a save, archive, then put autosave back the way
/// it was. Once `save-off` went through, autosave is restored even when the
/// save or the archive fails.
pub async fn archive_with_commit<C: WorldConsole>(console: &C) -> ServerResult<PathBuf> {
    let autosave = console.probe_autosave().await?;
    console.send_console("save-off").await?;

    let archived = async {
        console.save_and_wait().await?;
        console.archive_world().await
    }
    .await;

    let restored = if autosave {
        console.send_console("save-on").await
    } else {
        Ok(())
    };

    let path = archived?;
    restored?;
    Ok(path)
}

/// Index of the first needle found in an incoming line, or `None` when
/// `within` elapses (or the tail closes) first.
pub async fn await_log_line(
    lines: &mut mpsc::UnboundedReceiver<String>,
    needles: &[&str],
    within: Duration,
) -> Option<usize> {
    let search = async {
        while let Some(line) = lines.recv().await {
            if let Some(i) = needles.iter().position(|n| line.contains(n)) {
                return Some(i);
            }
        }
        None
    };
    tokio::time::timeout(within, search).await.ok().flatten()
}

impl ManagedServer {
    /// Follow `logs/latest.log` while `msg` is sent, returning which needle showed up.
    async fn console_and_watch(&self, msg: &str, needles: &[&str], within: Duration) -> ServerResult<Option<usize>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tail = TailWatcher::spawn(&self.env.cwd, LATEST_LOG, tx);
        // 이미 존재하는 로그는 끝에서부터 따라가므로 명령 전에 tail이 붙을 때까지 대기
        let _ = tokio::time::timeout(TAIL_SETTLE, tail.wait_for_tailing()).await;

        self.stuff(msg).await?;
        let found = await_log_line(&mut rx, needles, within).await;
        tail.close();
        Ok(found)
    }

    /// `save-all`, succeeding once the log confirms the world was saved.
    pub async fn saveall_latest_log(&self) -> ServerResult<()> {
        match self.console_and_watch("save-all", &[SAVED_THE_WORLD], SAVEALL_WAIT).await? {
            Some(_) => Ok(()),
            None => Err(ServerError::Timeout(format!(
                "save-all was not confirmed within {}s",
                SAVEALL_WAIT.as_secs()
            ))),
        }
    }

    pub async fn archive_with_commit(&self) -> ServerResult<PathBuf> {
        archive_with_commit(self).await
    }
}

impl WorldConsole for ManagedServer {
    /// Probes with `save-on`; a server that was saving-off is switched back.
    /// Servers that answer neither way are assumed to autosave.
    async fn probe_autosave(&self) -> ServerResult<bool> {
        let found = self
            .console_and_watch("save-on", &[AUTOSAVE_WAS_ON, AUTOSAVE_WAS_OFF], AUTOSAVE_PROBE)
            .await?;
        match found {
            Some(1) => {
                self.stuff("save-off").await?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn send_console(&self, msg: &str) -> ServerResult<()> {
        self.stuff(msg).await
    }

    async fn save_and_wait(&self) -> ServerResult<()> {
        self.saveall_latest_log().await
    }

    async fn archive_world(&self) -> ServerResult<PathBuf> {
        self.archive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConsole {
        autosave: bool,
        fail_save: bool,
        fail_archive: bool,
        sent: Mutex<Vec<String>>,
    }

    impl WorldConsole for FakeConsole {
        async fn probe_autosave(&self) -> ServerResult<bool> {
            Ok(self.autosave)
        }

        async fn send_console(&self, msg: &str) -> ServerResult<()> {
            self.sent.lock().unwrap().push(msg.to_string());
            Ok(())
        }

        async fn save_and_wait(&self) -> ServerResult<()> {
            self.sent.lock().unwrap().push("save-all".into());
            if self.fail_save {
                Err(ServerError::Timeout("save-all".into()))
            } else {
                Ok(())
            }
        }

        async fn archive_world(&self) -> ServerResult<PathBuf> {
            if self.fail_archive {
                Err(ServerError::tool("tar", "exited with 2"))
            } else {
                Ok(PathBuf::from("/archive/alpha/server-alpha.tgz"))
            }
        }
    }

    fn sent(console: &FakeConsole) -> Vec<String> {
        console.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn restores_autosave_after_commit() {
        let console = FakeConsole { autosave: true, ..Default::default() };
        let path = archive_with_commit(&console).await.unwrap();
        assert_eq!(path, PathBuf::from("/archive/alpha/server-alpha.tgz"));
        assert_eq!(sent(&console), vec!["save-off", "save-all", "save-on"]);
    }

    #[tokio::test]
    async fn leaves_autosave_off_when_it_was_off() {
        let console = FakeConsole::default();
        archive_with_commit(&console).await.unwrap();
        assert_eq!(sent(&console), vec!["save-off", "save-all"]);
    }

    #[tokio::test]
    async fn restores_autosave_when_save_fails() {
        let console = FakeConsole { autosave: true, fail_save: true, ..Default::default() };
        let err = archive_with_commit(&console).await.unwrap_err();
        assert_eq!(err.error_code(), "TIMEOUT");
        assert_eq!(sent(&console), vec!["save-off", "save-all", "save-on"]);
    }

    #[tokio::test]
    async fn restores_autosave_when_archive_fails() {
        let console = FakeConsole { autosave: true, fail_archive: true, ..Default::default() };
        let err = archive_with_commit(&console).await.unwrap_err();
        assert_eq!(err.error_code(), "EXTERNAL_TOOL_FAILED");
        assert_eq!(sent(&console).last().map(String::as_str), Some("save-on"));
    }

    #[tokio::test]
    async fn finds_first_matching_needle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send("[12:00:00] [Server thread/INFO]: Saving...".to_string()).unwrap();
        tx.send("[12:00:01] [Server thread/INFO]: Turned on world auto-saving".to_string()).unwrap();
        let found = await_log_line(&mut rx, &[AUTOSAVE_WAS_ON, AUTOSAVE_WAS_OFF], Duration::from_secs(1)).await;
        assert_eq!(found, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_deadline() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<String>();
        assert_eq!(await_log_line(&mut rx, &[SAVED_THE_WORLD], SAVEALL_WAIT).await, None);
    }
}
