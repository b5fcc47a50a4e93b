use flowline_core::wire::WireMsg;
use flowline_core::Task;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// Client-side replica of the task set, keyed by task id.
///
/// Hub broadcasts merge idempotently: applying the same event twice, or an
/// update for a task that raced past a local delete, converges to the same
/// cache a full resync would produce. Creates carry a correlation token so
/// the originator can tell its own echo from a foreign create.
#[derive(Debug, Default)]
pub struct SyncAgent {
    cache: HashMap<String, Task>,
    pending_tokens: HashSet<String>,
    selected: Option<String>,
}

impl SyncAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the replica and rebuild it from an authoritative listing.
    /// Pending tokens are cleared too: echoes owed by a previous session
    /// never arrive after a reconnect.
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        self.cache = tasks
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();
        self.pending_tokens.clear();
        if let Some(id) = &self.selected {
            if !self.cache.contains_key(id) {
                self.selected = None;
            }
        }
    }

    /// Mint a correlation token for a create about to be submitted.
    pub fn begin_create(&mut self) -> String {
        let token = Uuid::new_v4().to_string();
        self.pending_tokens.insert(token.clone());
        token
    }

    /// Merge the canonical record from a create response. The token stays
    /// pending: the hub answers before it broadcasts, so the echo is still
    /// on its way and retires the token itself.
    pub fn complete_create(&mut self, task: Task) {
        self.cache.insert(task.id.clone(), task);
    }

    pub fn fail_create(&mut self, token: &str) {
        self.pending_tokens.remove(token);
    }

    pub fn apply_update(&mut self, task: Task) {
        self.cache.insert(task.id.clone(), task);
    }

    pub fn apply_delete(&mut self, id: &str) -> bool {
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        self.cache.remove(id).is_some()
    }

    /// Fold one hub broadcast into the replica. Returns `true` when the event
    /// came from another client, `false` for own echoes and non-data frames.
    pub fn apply_event(&mut self, msg: &WireMsg) -> bool {
        match msg {
            WireMsg::Created(payload) => {
                if let Some(token) = payload.correlation_token.as_deref() {
                    if self.pending_tokens.remove(token) {
                        // Own create coming back around; the direct response
                        // already merged it.
                        debug!(event = "own_create_echo", id = %payload.task.id);
                        return false;
                    }
                }
                self.cache
                    .entry(payload.task.id.clone())
                    .or_insert_with(|| payload.task.clone());
                true
            }
            WireMsg::Updated(payload) => {
                if !self.cache.contains_key(&payload.task.id) {
                    warn!(
                        event = "concurrency_anomaly",
                        id = %payload.task.id,
                        "update for a task not in the replica"
                    );
                }
                self.apply_update(payload.task.clone());
                true
            }
            WireMsg::Deleted(payload) => {
                self.apply_delete(&payload.id);
                true
            }
            _ => false,
        }
    }

    /// Mark a cached task as selected; unknown ids are refused.
    pub fn select(&mut self, id: &str) -> bool {
        if self.cache.contains_key(id) {
            self.selected = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.cache.get(id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Snapshot ordered by start time, then id for a stable tie-break.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.cache.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }
}
