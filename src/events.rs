//! Outbound events and the bus carrying them to whatever transport is attached.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::supervisor::notice::Notice;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub up: bool,
    pub memory: Value,
    pub ping: Value,
    pub query: Value,
}

/// Everything the daemon pushes outward. The `event` tag is the wire name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "heartbeat")]
    Heartbeat {
        server_name: String,
        timestamp: u64,
        payload: HeartbeatPayload,
    },
    #[serde(rename = "server_ack")]
    ServerAck {
        server_name: String,
        #[serde(flatten)]
        notice: Notice,
    },
    #[serde(rename = "server_fin")]
    ServerFin {
        server_name: String,
        #[serde(flatten)]
        notice: Notice,
    },
    /// Answer to a single property request; shares `server_fin` on the wire.
    #[serde(rename = "server_fin")]
    PropertyFin {
        server_name: String,
        property: String,
        payload: Value,
    },
    #[serde(rename = "tail_data")]
    TailData {
        server_name: String,
        filepath: String,
        payload: String,
    },
    #[serde(rename = "file head")]
    FileHead {
        server_name: String,
        filename: String,
        payload: String,
    },
    #[serde(rename = "eula")]
    Eula {
        server_name: String,
        accepted: Option<bool>,
    },
    #[serde(rename = "server.properties")]
    ServerProperties { server_name: String, payload: Value },
    #[serde(rename = "server.config")]
    ServerConfig { server_name: String, payload: Value },
    #[serde(rename = "cron.config")]
    CronConfig { server_name: String, payload: Value },
    /// base64 of the PNG.
    #[serde(rename = "server-icon.png")]
    ServerIcon { server_name: String, payload: String },
    #[serde(rename = "config.yml")]
    ConfigYml { server_name: String, payload: String },
    #[serde(rename = "notices")]
    Notices {
        server_name: String,
        payload: Vec<Notice>,
    },
    #[serde(rename = "page_data")]
    PageData {
        server_name: String,
        page: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    #[serde(rename = "track_server")]
    TrackServer { server_name: String },
    #[serde(rename = "untrack_server")]
    UntrackServer { server_name: String },
    #[serde(rename = "host_heartbeat")]
    HostHeartbeat {
        uptime: u64,
        freemem: u64,
        loadavg: [f64; 3],
    },
    #[serde(rename = "host_notice")]
    HostNotice {
        command: String,
        success: bool,
        help_text: String,
    },
    #[serde(rename = "archive_list")]
    ArchiveList { payload: Value },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Heartbeat { .. } => "heartbeat",
            Event::ServerAck { .. } => "server_ack",
            Event::ServerFin { .. } | Event::PropertyFin { .. } => "server_fin",
            Event::TailData { .. } => "tail_data",
            Event::FileHead { .. } => "file head",
            Event::Eula { .. } => "eula",
            Event::ServerProperties { .. } => "server.properties",
            Event::ServerConfig { .. } => "server.config",
            Event::CronConfig { .. } => "cron.config",
            Event::ServerIcon { .. } => "server-icon.png",
            Event::ConfigYml { .. } => "config.yml",
            Event::Notices { .. } => "notices",
            Event::PageData { .. } => "page_data",
            Event::TrackServer { .. } => "track_server",
            Event::UntrackServer { .. } => "untrack_server",
            Event::HostHeartbeat { .. } => "host_heartbeat",
            Event::HostNotice { .. } => "host_notice",
            Event::ArchiveList { .. } => "archive_list",
        }
    }

    /// Instance the event belongs to; `None` for host-wide events.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Event::Heartbeat { server_name, .. }
            | Event::ServerAck { server_name, .. }
            | Event::ServerFin { server_name, .. }
            | Event::PropertyFin { server_name, .. }
            | Event::TailData { server_name, .. }
            | Event::FileHead { server_name, .. }
            | Event::Eula { server_name, .. }
            | Event::ServerProperties { server_name, .. }
            | Event::ServerConfig { server_name, .. }
            | Event::CronConfig { server_name, .. }
            | Event::ServerIcon { server_name, .. }
            | Event::ConfigYml { server_name, .. }
            | Event::Notices { server_name, .. }
            | Event::PageData { server_name, .. }
            | Event::TrackServer { server_name }
            | Event::UntrackServer { server_name } => Some(server_name),
            Event::HostHeartbeat { .. } | Event::HostNotice { .. } | Event::ArchiveList { .. } => None,
        }
    }
}

/// Fan-out of events to every subscriber. Emitting with nobody listening is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        if tracing::enabled!(target: "events", tracing::Level::DEBUG) {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::debug!(target: "events", "{}", line);
            }
        }
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names() {
        let ev = Event::FileHead {
            server_name: "alpha".into(),
            filename: "logs/latest.log".into(),
            payload: "hello".into(),
        };
        let wire = serde_json::to_value(&ev).unwrap();
        assert_eq!(wire["event"], "file head");
        assert_eq!(wire["filename"], "logs/latest.log");
        assert_eq!(ev.name(), "file head");
        assert_eq!(ev.server_name(), Some("alpha"));
    }

    #[test]
    fn fin_flattens_notice() {
        let mut notice = Notice::acknowledge(&json!({"command": "backup"}));
        notice.resolve(Ok(Value::Null));
        let wire = serde_json::to_value(Event::ServerFin { server_name: "alpha".into(), notice }).unwrap();
        assert_eq!(wire["event"], "server_fin");
        assert_eq!(wire["command"], "backup");
        assert_eq!(wire["success"], true);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        bus.emit(Event::TrackServer { server_name: "lost".into() });

        let mut rx = bus.subscribe();
        bus.emit(Event::UntrackServer { server_name: "alpha".into() });
        match rx.recv().await.unwrap() {
            Event::UntrackServer { server_name } => assert_eq!(server_name, "alpha"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
