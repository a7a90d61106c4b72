//! Session log store: the ordered list of completed sessions and the
//! pending-finalize record.

use crate::models::{PendingFinalize, Session};
use crate::persistence::{keys, Database, DatabaseError};
use crate::timer::TimerMessage;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Task is required")]
    EmptyTask,
    #[error("End must be after start")]
    EndNotAfterStart,
    #[error("Invalid time '{0}', expected YYYY-MM-DD HH:MM:SS UTC")]
    InvalidTime(String),
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("No count-up session is waiting for a name")]
    NoPending,
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Replacement values for an edited session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEdit {
    pub task: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

fn new_session_id() -> String {
    format!("s_{}", Uuid::new_v4().simple())
}

/// Checks the invariants every stored session must hold.
fn validate(session: &Session) -> Result<(), LogError> {
    if session.task.trim().is_empty() {
        return Err(LogError::EmptyTask);
    }
    let start = session
        .start_at()
        .ok_or_else(|| LogError::InvalidTime(session.start.clone()))?;
    let end = session
        .end_at()
        .ok_or_else(|| LogError::InvalidTime(session.end.clone()))?;
    if end <= start {
        return Err(LogError::EndNotAfterStart);
    }
    Ok(())
}

pub struct SessionLog {
    db: Arc<Database>,
    tx: Sender<TimerMessage>,
}

impl SessionLog {
    pub fn new(db: Arc<Database>, tx: Sender<TimerMessage>) -> Self {
        Self { db, tx }
    }

    /// Returns all sessions in log order. Sessions stored without an id get
    /// one, and the log is saved back.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.db.load(keys::TIME_LOG).unwrap_or_default();

        let mut changed = false;
        for session in sessions.iter_mut().filter(|s| s.id.is_empty()) {
            session.id = new_session_id();
            changed = true;
        }
        if changed {
            if let Err(e) = self.db.save(keys::TIME_LOG, &sessions) {
                warn!(error = %e, "Failed to save assigned session ids");
            }
        }

        sessions
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.list().into_iter().find(|s| s.id == id)
    }

    fn save_all(&self, sessions: &[Session]) -> Result<(), LogError> {
        self.db.save(keys::TIME_LOG, sessions)?;
        let _ = self.tx.send(TimerMessage::LogUpdated);
        Ok(())
    }

    /// Appends a session, assigning an id if it has none.
    pub fn append(&self, mut session: Session) -> Result<Session, LogError> {
        validate(&session)?;
        if session.id.is_empty() {
            session.id = new_session_id();
        }

        let mut sessions = self.list();
        sessions.push(session.clone());
        self.save_all(&sessions)?;

        info!(
            id = %session.id,
            task = %session.task,
            duration = %session.duration,
            "Session logged"
        );
        Ok(session)
    }

    /// Builds and appends a session for the given span.
    pub fn record(
        &self,
        task: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Session, LogError> {
        self.append(Session::new(task, start, end))
    }

    /// Replaces task, start and end of an existing session. The id is kept.
    pub fn update(&self, id: &str, edit: SessionEdit) -> Result<Session, LogError> {
        let mut updated = Session::new(&edit.task, edit.start, edit.end);
        updated.id = id.to_string();
        validate(&updated)?;

        let mut sessions = self.list();
        let slot = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| LogError::NotFound(id.to_string()))?;
        *slot = updated.clone();
        self.save_all(&sessions)?;

        Ok(updated)
    }

    /// Removes a session by id and returns it.
    pub fn delete(&self, id: &str) -> Result<Session, LogError> {
        let mut sessions = self.list();
        let index = sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| LogError::NotFound(id.to_string()))?;
        let removed = sessions.remove(index);
        self.save_all(&sessions)?;
        Ok(removed)
    }

    /// Deletes every session.
    pub fn clear(&self) -> Result<(), LogError> {
        self.db.remove(keys::TIME_LOG)?;
        let _ = self.tx.send(TimerMessage::LogUpdated);
        Ok(())
    }

    /// Count-ups waiting for a name, oldest first.
    pub fn pending_all(&self) -> Vec<PendingFinalize> {
        match self.db.load::<StoredPending>(keys::PENDING_FINALIZE) {
            Some(StoredPending::Queue(queue)) => queue,
            Some(StoredPending::Single(pending)) => vec![pending],
            None => Vec::new(),
        }
    }

    /// The oldest count-up waiting for a name, if any.
    pub fn pending(&self) -> Option<PendingFinalize> {
        self.pending_all().into_iter().next()
    }

    /// Queues a count-up for naming behind any that are already waiting.
    pub fn push_pending(&self, pending: &PendingFinalize) -> Result<(), LogError> {
        let mut queue = self.pending_all();
        queue.push(pending.clone());
        self.save_pending(&queue)
    }

    fn save_pending(&self, queue: &[PendingFinalize]) -> Result<(), LogError> {
        if queue.is_empty() {
            self.db.remove(keys::PENDING_FINALIZE)?;
        } else {
            self.db.save(keys::PENDING_FINALIZE, queue)?;
        }
        Ok(())
    }

    /// Logs the oldest pending count-up under `task` and drops it from the queue.
    pub fn commit_pending(&self, task: &str) -> Result<Session, LogError> {
        let mut queue = self.pending_all();
        let pending = queue.first().cloned().ok_or(LogError::NoPending)?;
        let start = pending
            .start_at()
            .ok_or_else(|| LogError::InvalidTime(pending.start.clone()))?;
        let end = pending
            .end_at()
            .ok_or_else(|| LogError::InvalidTime(pending.end.clone()))?;

        let session = self.record(task, start, end)?;
        queue.remove(0);
        self.save_pending(&queue)?;
        Ok(session)
    }

    /// Drops the oldest pending count-up without logging it.
    pub fn discard_pending(&self) -> Result<PendingFinalize, LogError> {
        let mut queue = self.pending_all();
        if queue.is_empty() {
            return Err(LogError::NoPending);
        }
        let dropped = queue.remove(0);
        self.save_pending(&queue)?;
        Ok(dropped)
    }
}

/// Stored form of the pending records; a lone object is read as a queue of one.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPending {
    Queue(Vec<PendingFinalize>),
    Single(PendingFinalize),
}
