use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::now_millis;

/// Receipt of one command, from acknowledgement to resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub command: String,
    pub uuid: String,
    pub time_initiated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_resolved: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// The request's own arguments, echoed back.
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl Notice {
    /// Fresh receipt for an inbound `{command, ...args}` request.
    pub fn acknowledge(request: &Value) -> Self {
        let mut args = request.as_object().cloned().unwrap_or_default();
        let command = match args.remove("command") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        // 클라이언트가 보낸 값으로 수신 정보를 덮어쓰지 않도록 제거
        for reserved in [
            "uuid",
            "time_initiated",
            "time_resolved",
            "success",
            "error",
            "payload",
            "server_name",
        ] {
            args.remove(reserved);
        }
        Self {
            command,
            uuid: uuid::Uuid::new_v4().to_string(),
            time_initiated: now_millis(),
            time_resolved: None,
            success: None,
            error: None,
            payload: None,
            args,
        }
    }

    pub fn resolve(&mut self, outcome: Result<Value, String>) {
        self.time_resolved = Some(now_millis());
        match outcome {
            Ok(payload) => {
                self.success = Some(true);
                self.payload = (!payload.is_null()).then_some(payload);
            }
            Err(error) => {
                self.success = Some(false);
                self.error = Some(error);
            }
        }
    }
}

pub const NOTICE_CAP: usize = 10;

/// The most recent resolved commands, oldest first.
#[derive(Debug, Default)]
pub struct NoticeBoard {
    notices: VecDeque<Notice>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notice: Notice) {
        while self.notices.len() >= NOTICE_CAP {
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }

    pub fn snapshot(&self) -> Vec<Notice> {
        self.notices.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}
