//! Persistent store for Mission Control.
//!
//! The whole data set lives in memory behind a mutex and is rewritten to a
//! pretty-printed JSON file after every mutation. Each mutation runs against a
//! copy of the snapshot, so a failed operation (or a failed write) leaves the
//! previous state untouched.

pub mod agents;
pub mod consistency;
pub mod planning;
pub mod sessions;
pub mod tasks;

use crate::error::{CoreError, CoreResult};
use crate::types::{Agent, PlanningSession, Session, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

pub use consistency::ConsistencyIssue;

/// The four collections, in the on-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default, rename = "planningSessions")]
    pub planning_sessions: Vec<PlanningSession>,
}

impl Snapshot {
    pub fn task(&self, id: &str) -> CoreResult<&Task> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::task_not_found(id))
    }

    pub fn task_mut(&mut self, id: &str) -> CoreResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::task_not_found(id))
    }

    pub fn agent(&self, id: &str) -> CoreResult<&Agent> {
        self.agents
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::agent_not_found(id))
    }

    pub fn agent_mut(&mut self, id: &str) -> CoreResult<&mut Agent> {
        self.agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::agent_not_found(id))
    }

    pub fn session(&self, id: &str) -> CoreResult<&Session> {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::session_not_found(id))
    }

    pub fn session_mut(&mut self, id: &str) -> CoreResult<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::session_not_found(id))
    }

    pub fn planning_session(&self, id: &str) -> CoreResult<&PlanningSession> {
        self.planning_sessions
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::planning_session_not_found(id))
    }

    pub fn planning_session_mut(&mut self, id: &str) -> CoreResult<&mut PlanningSession> {
        self.planning_sessions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::planning_session_not_found(id))
    }

    /// Agents that are idle, oldest first.
    pub fn idle_agents(&self) -> Vec<&Agent> {
        let mut idle: Vec<&Agent> = self
            .agents
            .iter()
            .filter(|a| a.status == crate::types::AgentStatus::Idle)
            .collect();
        idle.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        idle
    }

    /// Cancel every active session matching `pred`. Returns the cancelled ids.
    pub(crate) fn cancel_active_sessions<F>(&mut self, now: DateTime<Utc>, pred: F) -> Vec<String>
    where
        F: Fn(&Session) -> bool,
    {
        let mut cancelled = Vec::new();
        for session in self
            .sessions
            .iter_mut()
            .filter(|s| !s.status.is_terminal() && pred(s))
        {
            if session.cancel(now).is_ok() {
                cancelled.push(session.id.clone());
            }
        }
        cancelled
    }
}

/// Database handle wrapping the in-memory snapshot and its backing file.
#[derive(Clone)]
pub struct Database {
    data: Arc<Mutex<Snapshot>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the data file at the given path.
    ///
    /// A missing or empty file starts an empty store; the file is written
    /// immediately so the location is validated up front.
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let snapshot = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            Snapshot::default()
        };

        info!(
            path = %path.display(),
            tasks = snapshot.tasks.len(),
            agents = snapshot.agents.len(),
            "Opened data file"
        );

        persist(&path, &snapshot)?;

        Ok(Self {
            data: Arc::new(Mutex::new(snapshot)),
            path: Some(path),
        })
    }

    /// Open a store that is never written to disk (for testing).
    pub fn open_in_memory() -> Self {
        Self {
            data: Arc::new(Mutex::new(Snapshot::default())),
            path: None,
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        // A panic while holding the lock cannot leave a half-applied snapshot
        // because mutations run against a copy.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Execute a function with shared access to the snapshot.
    pub fn with_data<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Snapshot) -> CoreResult<T>,
    {
        let data = self.lock();
        f(&data)
    }

    /// Execute a mutation as a single store write.
    ///
    /// The closure runs against a copy; the copy is persisted and installed
    /// only if the closure succeeds.
    pub fn with_data_mut<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Snapshot) -> CoreResult<T>,
    {
        let mut data = self.lock();
        let mut draft = data.clone();
        let out = f(&mut draft)?;
        if let Some(path) = &self.path {
            persist(path, &draft)?;
        }
        *data = draft;
        Ok(out)
    }

    /// A full copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }
}

/// Write the snapshot to a sibling temp file and rename it over `path`.
fn persist(path: &Path, snapshot: &Snapshot) -> CoreResult<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Persisted data file");
    Ok(())
}

/// Current timestamp.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Generate a new entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
