use crate::{Task, TaskDraft, TaskFilter, TaskPatch};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

fn default_version() -> u16 {
    CURRENT_PROTOCOL_VERSION
}

/// One JSON frame on the WebSocket channel, request/response and push alike.
/// Responses echo the `request_id` of the request they answer; push events
/// carry none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default = "default_version")]
    pub version: u16,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: &str, request_id: Option<String>, msg: WireMsg) -> Self {
        Self {
            version: CURRENT_PROTOCOL_VERSION,
            sender_id: sender_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    // client -> hub
    Hello(HelloPayload),
    CreateTask(CreateTaskPayload),
    ReadTask(TaskIdPayload),
    UpdateTask(UpdateTaskPayload),
    DeleteTask(TaskIdPayload),
    ListTasks(ListTasksPayload),
    SyncRequest(SyncRequestPayload),
    // hub -> client, responses
    TaskOk(TaskPayload),
    TaskListOk(TaskListPayload),
    DeleteOk(TaskIdPayload),
    Error(ErrorPayload),
    // hub -> client, push
    Created(CreatedPayload),
    Updated(TaskPayload),
    Deleted(TaskIdPayload),
    TimeUpdate(TimeUpdatePayload),
    SyncAck(SyncAckPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    #[serde(flatten)]
    pub draft: TaskDraft,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskIdPayload {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateTaskPayload {
    pub id: String,
    #[serde(flatten)]
    pub patch: TaskPatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListTasksPayload {
    #[serde(flatten)]
    pub filter: TaskFilter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequestPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    #[serde(flatten)]
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskListPayload {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPayload {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeUpdatePayload {
    pub instant: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncAckPayload {
    pub server_instant: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Transport,
    Internal,
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

pub fn validate_envelope(msg: &WireEnvelope) -> Result<(), &'static str> {
    if msg.version > CURRENT_PROTOCOL_VERSION {
        return Err("unsupported_version");
    }
    if msg.sender_id.is_empty() {
        return Err("missing_sender_id");
    }
    if chrono::DateTime::parse_from_rfc3339(&msg.timestamp).is_err() {
        return Err("invalid_timestamp");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskStatus;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .expect("valid date")
            .and_hms_opt(9, 0, 0)
            .expect("valid time")
    }

    fn task() -> Task {
        Task {
            id: "11111111-2222-3333-4444-555555555555".to_string(),
            title: "Standup".to_string(),
            start_time: start(),
            duration_minutes: 15,
            color: "#4f8fea".to_string(),
            status: TaskStatus::Pending,
            owner_tag: String::new(),
        }
    }

    #[test]
    fn create_request_serializes_tag_payload_and_token() {
        let envelope = WireEnvelope::new(
            "client-a",
            Some("req-1".to_string()),
            WireMsg::CreateTask(CreateTaskPayload {
                draft: TaskDraft {
                    title: "Standup".to_string(),
                    start_time: start(),
                    duration_minutes: 15,
                    color: String::new(),
                    status: TaskStatus::Pending,
                    owner_tag: String::new(),
                },
                correlation_token: Some("tok-9".to_string()),
            }),
        );
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "create_task");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["payload"]["title"], "Standup");
        assert_eq!(value["payload"]["duration"], 15);
        assert_eq!(value["payload"]["correlationToken"], "tok-9");
    }

    #[test]
    fn created_broadcast_echoes_token_unchanged() {
        let envelope = WireEnvelope::new(
            "flowline-hub",
            None,
            WireMsg::Created(CreatedPayload {
                task: task(),
                correlation_token: Some("tok-9".to_string()),
            }),
        );
        let text = serde_json::to_string(&envelope).expect("serialize");
        let decoded: WireEnvelope = serde_json::from_str(&text).expect("decode");
        match decoded.msg {
            WireMsg::Created(payload) => {
                assert_eq!(payload.correlation_token.as_deref(), Some("tok-9"));
                assert_eq!(payload.task, task());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn push_events_round_trip() {
        for msg in [
            WireMsg::Updated(TaskPayload { task: task() }),
            WireMsg::Deleted(TaskIdPayload {
                id: "42".to_string(),
            }),
            WireMsg::TimeUpdate(TimeUpdatePayload { instant: start() }),
            WireMsg::SyncAck(SyncAckPayload {
                server_instant: start(),
            }),
        ] {
            let envelope = WireEnvelope::new("flowline-hub", None, msg);
            let text = serde_json::to_string(&envelope).expect("serialize");
            let decoded: WireEnvelope = serde_json::from_str(&text).expect("decode");
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let decoded: WireEnvelope = serde_json::from_str(
            r#"{
                "sender_id": "client-a",
                "timestamp": "2025-01-01T09:00:00Z",
                "type": "sync_request",
                "payload": {}
            }"#,
        )
        .expect("decode");
        assert_eq!(decoded.version, CURRENT_PROTOCOL_VERSION);
        assert!(validate_envelope(&decoded).is_ok());
    }

    #[test]
    fn envelope_validation_rejects_bad_fields() {
        let mut envelope = WireEnvelope::new("client-a", None, WireMsg::SyncRequest(SyncRequestPayload {}));
        envelope.version = CURRENT_PROTOCOL_VERSION + 1;
        assert_eq!(validate_envelope(&envelope), Err("unsupported_version"));

        let mut envelope = WireEnvelope::new("", None, WireMsg::SyncRequest(SyncRequestPayload {}));
        assert_eq!(validate_envelope(&envelope), Err("missing_sender_id"));
        envelope.sender_id = "client-a".to_string();
        envelope.timestamp = "not-a-timestamp".to_string();
        assert_eq!(validate_envelope(&envelope), Err("invalid_timestamp"));
    }

    #[test]
    fn error_payload_omits_absent_context() {
        let payload = ErrorPayload {
            kind: ErrorKind::NotFound,
            field: None,
            id: Some("42".to_string()),
            message: "task not found: 42".to_string(),
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["kind"], "not_found");
        assert_eq!(value["id"], "42");
        assert!(value.get("field").is_none());
    }
}
