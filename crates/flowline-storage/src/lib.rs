use chrono::NaiveDateTime;
use flowline_core::{Task, TaskDraft, TaskFilter, TaskPatch, TaskStatus, ValidationError};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub const SCHEMA_VERSION: i64 = 1;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("task not found: {id}")]
    NotFound { id: String },
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Single source of truth for tasks. Callers see each operation as atomic;
/// every other copy of a task in the system is a cache of what lives here.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_tasks.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn create(&self, draft: &TaskDraft) -> Result<Task, StorageError> {
        draft.validate()?;

        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: draft.title.clone(),
            start_time: draft.start_time,
            duration_minutes: draft.duration_minutes,
            color: draft.resolved_color(),
            status: draft.status.clone(),
            owner_tag: draft.owner_tag.clone(),
        };

        self.conn.execute(
            "
            INSERT INTO tasks (
                id,
                title,
                start_time,
                duration_minutes,
                color,
                status,
                owner_tag
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                task.id,
                task.title,
                format_time(task.start_time),
                task.duration_minutes,
                task.color,
                task.status.as_str(),
                task.owner_tag,
            ],
        )?;

        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task, StorageError> {
        let task = self
            .conn
            .query_row(
                "
                SELECT id, title, start_time, duration_minutes, color, status, owner_tag
                FROM tasks
                WHERE id = ?1
                ",
                [id],
                task_from_row,
            )
            .optional()?;

        task.ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    /// Matching tasks ordered by ascending start time (ties broken by id so
    /// the order is deterministic).
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let mut sql = String::from(
            "SELECT id, title, start_time, duration_minutes, color, status, owner_tag FROM tasks",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut bound: Vec<String> = Vec::new();

        if let Some(after) = filter.start_after {
            clauses.push("start_time >= ?");
            bound.push(format_time(after));
        }
        if let Some(before) = filter.start_before {
            clauses.push("start_time <= ?");
            bound.push(format_time(before));
        }
        if let Some(status) = &filter.status {
            clauses.push("status = ?");
            bound.push(status.as_str().to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY start_time ASC, id ASC");

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(bound.iter()), task_from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Applies only the supplied fields, then re-validates the merged record
    /// before writing.
    pub fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, StorageError> {
        let mut task = self.get(id)?;
        patch.apply_to(&mut task);
        flowline_core::validate_task_fields(&task.title, task.duration_minutes, &task.color)?;

        self.conn.execute(
            "
            UPDATE tasks SET
                title = ?2,
                start_time = ?3,
                duration_minutes = ?4,
                color = ?5,
                status = ?6,
                owner_tag = ?7
            WHERE id = ?1
            ",
            params![
                task.id,
                task.title,
                format_time(task.start_time),
                task.duration_minutes,
                task.color,
                task.status.as_str(),
                task.owner_tag,
            ],
        )?;

        Ok(task)
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let changes = self.conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if changes == 0 {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn format_time(value: NaiveDateTime) -> String {
    value.format(TIME_FORMAT).to_string()
}

fn parse_time(value: &str) -> Result<NaiveDateTime, StorageError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn task_from_row(row: &Row<'_>) -> Result<Task, rusqlite::Error> {
    let start_raw: String = row.get(2)?;
    let start_time = parse_time(&start_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    let status_raw: String = row.get(5)?;
    let status = status_raw.parse::<TaskStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        start_time,
        duration_minutes: row.get(3)?,
        color: row.get(4)?,
        status,
        owner_tag: row.get(6)?,
    })
}
