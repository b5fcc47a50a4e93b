use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod timeline;
pub mod wire;

/// Shortest schedulable task, in minutes.
pub const MIN_DURATION_MINUTES: i64 = 15;
/// Presentation color assigned when a create request leaves it blank.
pub const DEFAULT_TASK_COLOR: &str = "#4f8fea";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub start_time: NaiveDateTime,
    #[serde(rename = "duration")]
    pub duration_minutes: i64,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub owner_tag: String,
}

/// Create input: everything except the store-assigned `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub title: String,
    pub start_time: NaiveDateTime,
    #[serde(rename = "duration")]
    pub duration_minutes: i64,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub owner_tag: String,
}

impl TaskDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_task_fields(&self.title, self.duration_minutes, &self.color)
    }

    pub fn resolved_color(&self) -> String {
        if self.color.trim().is_empty() {
            DEFAULT_TASK_COLOR.to_string()
        } else {
            self.color.clone()
        }
    }
}

/// Partial update: only supplied fields are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_tag: Option<String>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.start_time.is_none()
            && self.duration_minutes.is_none()
            && self.color.is_none()
            && self.status.is_none()
            && self.owner_tag.is_none()
    }

    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(start_time) = self.start_time {
            task.start_time = start_time;
        }
        if let Some(duration) = self.duration_minutes {
            task.duration_minutes = duration;
        }
        if let Some(color) = &self.color {
            task.color = color.clone();
        }
        if let Some(status) = &self.status {
            task.status = status.clone();
        }
        if let Some(owner_tag) = &self.owner_tag {
            task.owner_tag = owner_tag.clone();
        }
    }
}

/// Conjunctive list filter: every supplied predicate must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_before: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in-progress" | "in_progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "completed" | "complete" | "done" => Ok(TaskStatus::Completed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

pub fn validate_task_fields(
    title: &str,
    duration_minutes: i64,
    color: &str,
) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError {
            field: "title",
            message: "title must not be empty".to_string(),
        });
    }
    if duration_minutes < MIN_DURATION_MINUTES {
        return Err(ValidationError {
            field: "duration",
            message: format!("duration must be at least {MIN_DURATION_MINUTES} minutes"),
        });
    }
    if !color.trim().is_empty() && !is_valid_color(color) {
        return Err(ValidationError {
            field: "color",
            message: format!("color must look like #rrggbb, got {color}"),
        });
    }
    Ok(())
}

fn is_valid_color(value: &str) -> bool {
    let Some(hex) = value.strip_prefix('#') else {
        return false;
    };
    hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn default_color() -> String {
    DEFAULT_TASK_COLOR.to_string()
}
