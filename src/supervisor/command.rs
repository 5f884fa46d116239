//! Inbound `{command, ...args}` requests, parsed into a closed set of operations.

use std::fmt::Display;
use std::str::FromStr;

use serde::de::Error as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::error::{SupervisorError, SupervisorResult};
use crate::server::{ManagedServer, ServerResult};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerCommand {
    Start,
    Stop,
    Restart,
    Kill,
    StopAndBackup,
    Backup,
    Archive,
    ArchiveWithCommit,
    ListIncrements,
    ListArchives,
    Delete,
    Restore {
        #[serde(deserialize_with = "lenient_string")]
        step: String,
    },
    Prune {
        #[serde(deserialize_with = "lenient_string")]
        step: String,
    },
    Stuff {
        #[serde(deserialize_with = "lenient_string")]
        msg: String,
    },
    Saveall {
        #[serde(default, deserialize_with = "lenient_optional")]
        seconds_delay: Option<u64>,
    },
    SaveallLatestLog,
    ModifySp {
        #[serde(deserialize_with = "lenient_string")]
        property: String,
        #[serde(deserialize_with = "lenient_string")]
        new_value: String,
    },
    ModifySc {
        #[serde(deserialize_with = "lenient_string")]
        section: String,
        #[serde(deserialize_with = "lenient_string")]
        property: String,
        #[serde(deserialize_with = "lenient_string")]
        new_value: String,
    },
    AcceptEula,
    Chown {
        #[serde(deserialize_with = "lenient_number")]
        uid: u32,
        #[serde(deserialize_with = "lenient_number")]
        gid: u32,
    },
    SyncChown,
    RunInstaller,
    Renice {
        #[serde(deserialize_with = "lenient_number")]
        niceness: i32,
    },
    DeleteArchive {
        #[serde(deserialize_with = "lenient_string")]
        filename: String,
    },
    PreviousVersion {
        #[serde(deserialize_with = "lenient_string")]
        filepath: String,
        #[serde(deserialize_with = "lenient_string")]
        restore_as_of: String,
    },
    PreviousProperty {
        #[serde(deserialize_with = "lenient_string")]
        restore_as_of: String,
    },
}

impl ServerCommand {
    /// Parse a request, keeping request-level failures apart from operation failures.
    pub fn parse(request: &Value) -> SupervisorResult<Self> {
        parse_request(request)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerCommand::Start => "start",
            ServerCommand::Stop => "stop",
            ServerCommand::Restart => "restart",
            ServerCommand::Kill => "kill",
            ServerCommand::StopAndBackup => "stop_and_backup",
            ServerCommand::Backup => "backup",
            ServerCommand::Archive => "archive",
            ServerCommand::ArchiveWithCommit => "archive_with_commit",
            ServerCommand::ListIncrements => "list_increments",
            ServerCommand::ListArchives => "list_archives",
            ServerCommand::Delete => "delete",
            ServerCommand::Restore { .. } => "restore",
            ServerCommand::Prune { .. } => "prune",
            ServerCommand::Stuff { .. } => "stuff",
            ServerCommand::Saveall { .. } => "saveall",
            ServerCommand::SaveallLatestLog => "saveall_latest_log",
            ServerCommand::ModifySp { .. } => "modify_sp",
            ServerCommand::ModifySc { .. } => "modify_sc",
            ServerCommand::AcceptEula => "accept_eula",
            ServerCommand::Chown { .. } => "chown",
            ServerCommand::SyncChown => "sync_chown",
            ServerCommand::RunInstaller => "run_installer",
            ServerCommand::Renice { .. } => "renice",
            ServerCommand::DeleteArchive { .. } => "delete_archive",
            ServerCommand::PreviousVersion { .. } => "previous_version",
            ServerCommand::PreviousProperty { .. } => "previous_property",
        }
    }

    /// Removes the instance itself; the supervisor is torn down first and no notice is kept.
    pub fn is_destructive(&self) -> bool {
        matches!(self, ServerCommand::Delete)
    }

    /// Run against the instance. The value becomes the fin payload (`null` for none).
    pub async fn execute(&self, server: &ManagedServer) -> ServerResult<Value> {
        match self {
            ServerCommand::Start => server.start().await?,
            ServerCommand::Stop => server.stop().await?,
            ServerCommand::Restart => server.restart().await?,
            ServerCommand::Kill => server.kill().await?,
            ServerCommand::StopAndBackup => server.stop_and_backup().await?,
            ServerCommand::Backup => server.backup().await?,
            ServerCommand::Archive => {
                let path = server.archive().await?;
                return Ok(json!(path.display().to_string()));
            }
            ServerCommand::ArchiveWithCommit => {
                let path = server.archive_with_commit().await?;
                return Ok(json!(path.display().to_string()));
            }
            ServerCommand::ListIncrements => return Ok(json!(server.list_increments().await?)),
            ServerCommand::ListArchives => return Ok(json!(server.list_archives().await?)),
            ServerCommand::Delete => server.delete().await?,
            ServerCommand::Restore { step } => server.restore(step).await?,
            ServerCommand::Prune { step } => server.prune(step).await?,
            ServerCommand::Stuff { msg } => server.stuff(msg).await?,
            ServerCommand::Saveall { seconds_delay } => server.saveall(*seconds_delay).await?,
            ServerCommand::SaveallLatestLog => server.saveall_latest_log().await?,
            ServerCommand::ModifySp { property, new_value } => server.modify_sp(property, new_value).await?,
            ServerCommand::ModifySc { section, property, new_value } => {
                server.modify_sc(section, property, new_value).await?
            }
            ServerCommand::AcceptEula => server.accept_eula().await?,
            ServerCommand::Chown { uid, gid } => server.chown(*uid, *gid).await?,
            ServerCommand::SyncChown => server.sync_chown().await?,
            ServerCommand::RunInstaller => server.run_installer().await?,
            ServerCommand::Renice { niceness } => server.renice(*niceness).await?,
            ServerCommand::DeleteArchive { filename } => server.delete_archive(filename).await?,
            ServerCommand::PreviousVersion { filepath, restore_as_of } => {
                return Ok(json!(server.previous_version(filepath, restore_as_of).await?));
            }
            ServerCommand::PreviousProperty { restore_as_of } => {
                return Ok(json!(server.previous_property(restore_as_of).await?));
            }
        }
        Ok(Value::Null)
    }
}

/// Deserialize a `{command, ...}` request into one of a closed set of commands.
pub(crate) fn parse_request<T: DeserializeOwned>(request: &Value) -> SupervisorResult<T> {
    let name = match request.get("command") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(SupervisorError::InvalidArgument("command must be a string".into())),
        None => return Err(SupervisorError::MissingArgument("command".into())),
    };
    T::deserialize(request).map_err(|e| classify(&name, e))
}

fn classify(name: &str, err: serde_json::Error) -> SupervisorError {
    let msg = err.to_string();
    if msg.starts_with("unknown variant") {
        return SupervisorError::UnknownCommand(name.to_string());
    }
    if let Some(field) = msg.strip_prefix("missing field `").and_then(|rest| rest.split('`').next()) {
        return SupervisorError::MissingArgument(field.to_string());
    }
    SupervisorError::InvalidArgument(msg)
}

// cron.config stores every argument as a string, clients send whatever JSON they like

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    scalar_text(&value).ok_or_else(|| D::Error::custom(format!("expected a string, found {}", value)))
}

fn lenient_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value = Value::deserialize(deserializer)?;
    let text = scalar_text(&value).ok_or_else(|| D::Error::custom(format!("expected a number, found {}", value)))?;
    text.trim().parse().map_err(D::Error::custom)
}

fn lenient_optional<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value = Value::deserialize(deserializer)?;
    match scalar_text(&value) {
        None if value.is_null() => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) => text.trim().parse().map(Some).map_err(D::Error::custom),
        None => Err(D::Error::custom(format!("expected a number, found {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_commands_ignore_extra_args() {
        let cmd = ServerCommand::parse(&json!({"command": "start", "uuid": "x"})).unwrap();
        assert_eq!(cmd, ServerCommand::Start);
        assert_eq!(cmd.name(), "start");
    }

    #[test]
    fn numbers_accepted_as_strings() {
        let cmd = ServerCommand::parse(&json!({"command": "chown", "uid": "1000", "gid": 1001})).unwrap();
        assert_eq!(cmd, ServerCommand::Chown { uid: 1000, gid: 1001 });

        let cmd = ServerCommand::parse(&json!({"command": "modify_sp", "property": "max-players", "new_value": 20}))
            .unwrap();
        assert_eq!(
            cmd,
            ServerCommand::ModifySp { property: "max-players".into(), new_value: "20".into() }
        );
    }

    #[test]
    fn optional_delay() {
        let cmd = ServerCommand::parse(&json!({"command": "saveall"})).unwrap();
        assert_eq!(cmd, ServerCommand::Saveall { seconds_delay: None });
        let cmd = ServerCommand::parse(&json!({"command": "saveall", "seconds_delay": "30"})).unwrap();
        assert_eq!(cmd, ServerCommand::Saveall { seconds_delay: Some(30) });
    }

    #[test]
    fn missing_argument_is_request_error() {
        let err = ServerCommand::parse(&json!({"command": "restore"})).unwrap_err();
        assert!(matches!(err, SupervisorError::MissingArgument(ref f) if f == "step"), "{:?}", err);

        let err = ServerCommand::parse(&json!({"step": "1B"})).unwrap_err();
        assert!(matches!(err, SupervisorError::MissingArgument(ref f) if f == "command"));
    }

    #[test]
    fn unknown_command() {
        let err = ServerCommand::parse(&json!({"command": "fly"})).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command 'fly'");
    }

    #[test]
    fn malformed_argument() {
        let err = ServerCommand::parse(&json!({"command": "renice", "niceness": "high"})).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn only_delete_is_destructive() {
        assert!(ServerCommand::Delete.is_destructive());
        assert!(!ServerCommand::Kill.is_destructive());
    }
}
