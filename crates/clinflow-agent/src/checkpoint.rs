use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::WorkflowState;
use clinflow_core::traits::Checkpointer;
use clinflow_core::types::{CheckpointEntry, CheckpointPosition, RunId};

/// Snapshot `state` at `position`.
pub fn snapshot(state: &WorkflowState, position: CheckpointPosition) -> Result<CheckpointEntry> {
    Ok(CheckpointEntry {
        run_id: state.run_id().clone(),
        state_json: serde_json::to_string(state)?,
        position,
        updated_at: Utc::now(),
    })
}

/// Rebuild the state held by `entry`.
pub fn restore(entry: &CheckpointEntry) -> Result<WorkflowState> {
    let state: WorkflowState = serde_json::from_str(&entry.state_json)?;
    state.validate()?;
    Ok(state)
}

fn db_err(context: &str, e: impl std::fmt::Display) -> ClinflowError {
    ClinflowError::Database(format!("{}: {}", context, e))
}

/// Persistent checkpoint store backed by SQLite.
pub struct SqliteCheckpointer {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointer {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| db_err("Failed to open checkpoint store", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 run_id TEXT PRIMARY KEY,
                 state_json TEXT NOT NULL,
                 position TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| db_err("Failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| db_err("Checkpoint store lock poisoned", e))
    }
}

impl Checkpointer for SqliteCheckpointer {
    fn get(&self, run_id: &RunId) -> Result<Option<CheckpointEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT run_id, state_json, position, updated_at
                 FROM checkpoints WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| db_err("Failed to load checkpoint", e))?;

        let Some((id, state_json, position, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(CheckpointEntry {
            run_id: RunId(id),
            state_json,
            position: serde_json::from_str(&position)?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    fn put(&self, entry: &CheckpointEntry) -> Result<()> {
        let position = serde_json::to_string(&entry.position)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO checkpoints (run_id, state_json, position, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.run_id.as_str(),
                    entry.state_json,
                    position,
                    entry.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| db_err("Failed to save checkpoint", e))?;
        Ok(())
    }

    fn transition(
        &self,
        run_id: &RunId,
        from: &CheckpointPosition,
        to: &CheckpointPosition,
    ) -> Result<bool> {
        let from = serde_json::to_string(from)?;
        let to = serde_json::to_string(to)?;
        let changed = self
            .conn()?
            .execute(
                "UPDATE checkpoints SET position = ?3, updated_at = ?4
                 WHERE run_id = ?1 AND position = ?2",
                params![run_id.as_str(), from, to, Utc::now().to_rfc3339()],
            )
            .map_err(|e| db_err("Failed to move checkpoint", e))?;
        Ok(changed == 1)
    }
}

/// In-process checkpoint store; lost on restart.
#[derive(Default)]
pub struct MemoryCheckpointer {
    entries: Mutex<HashMap<RunId, CheckpointEntry>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn get(&self, run_id: &RunId) -> Result<Option<CheckpointEntry>> {
        let entries = self.entries.lock().map_err(|e| db_err("Checkpoint map poisoned", e))?;
        Ok(entries.get(run_id).cloned())
    }

    fn put(&self, entry: &CheckpointEntry) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| db_err("Checkpoint map poisoned", e))?;
        entries.insert(entry.run_id.clone(), entry.clone());
        Ok(())
    }

    fn transition(
        &self,
        run_id: &RunId,
        from: &CheckpointPosition,
        to: &CheckpointPosition,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(|e| db_err("Checkpoint map poisoned", e))?;
        match entries.get_mut(run_id) {
            Some(entry) if entry.position == *from => {
                entry.position = to.clone();
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinflow_test_utils::emergency_encounter;

    fn temp_store() -> SqliteCheckpointer {
        let dir =
            std::env::temp_dir().join(format!("clinflow_checkpoint_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        SqliteCheckpointer::open(&dir.join("checkpoints.db")).unwrap()
    }

    fn awaiting_state() -> WorkflowState {
        let mut state = WorkflowState::new(emergency_encounter()).unwrap();
        state.awaiting_confirmation = true;
        state.emergency = true;
        state.messages.push("paused".into());
        state
    }

    #[test]
    fn test_put_and_get() {
        let store = temp_store();
        let state = awaiting_state();
        store
            .put(&snapshot(&state, CheckpointPosition::AwaitingConfirmation).unwrap())
            .unwrap();

        let loaded = store.get(state.run_id()).unwrap().unwrap();
        assert_eq!(loaded.position, CheckpointPosition::AwaitingConfirmation);
        assert_eq!(restore(&loaded).unwrap(), state);
    }

    #[test]
    fn test_put_replaces_same_run() {
        let store = temp_store();
        let mut state = awaiting_state();
        store
            .put(&snapshot(&state, CheckpointPosition::AwaitingConfirmation).unwrap())
            .unwrap();
        state.awaiting_confirmation = false;
        store
            .put(&snapshot(&state, CheckpointPosition::Completed).unwrap())
            .unwrap();

        let loaded = store.get(state.run_id()).unwrap().unwrap();
        assert_eq!(loaded.position, CheckpointPosition::Completed);
        assert!(!restore(&loaded).unwrap().awaiting_confirmation);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cp.db");
        let state = awaiting_state();
        {
            let store = SqliteCheckpointer::open(&path).unwrap();
            store
                .put(&snapshot(&state, CheckpointPosition::AwaitingConfirmation).unwrap())
                .unwrap();
        }
        let reopened = SqliteCheckpointer::open(&path).unwrap();
        let loaded = reopened.get(state.run_id()).unwrap().unwrap();
        assert_eq!(loaded.position, CheckpointPosition::AwaitingConfirmation);
        assert_eq!(restore(&loaded).unwrap(), state);
    }

    fn assert_claims_once(store: &dyn Checkpointer) {
        let state = awaiting_state();
        let resumed = CheckpointPosition::Running { last_step: "resume".into() };
        assert!(!store
            .transition(state.run_id(), &CheckpointPosition::AwaitingConfirmation, &resumed)
            .unwrap());

        store
            .put(&snapshot(&state, CheckpointPosition::AwaitingConfirmation).unwrap())
            .unwrap();
        assert!(store
            .transition(state.run_id(), &CheckpointPosition::AwaitingConfirmation, &resumed)
            .unwrap());
        assert!(!store
            .transition(state.run_id(), &CheckpointPosition::AwaitingConfirmation, &resumed)
            .unwrap());

        let loaded = store.get(state.run_id()).unwrap().unwrap();
        assert_eq!(loaded.position, resumed);
        assert_eq!(restore(&loaded).unwrap(), state);
    }

    #[test]
    fn test_transition_claims_a_position_once() {
        assert_claims_once(&temp_store());
        assert_claims_once(&MemoryCheckpointer::new());
    }

    #[test]
    fn test_get_nonexistent() {
        let store = temp_store();
        assert!(store.get(&RunId::from("nope")).unwrap().is_none());
        assert!(MemoryCheckpointer::new().get(&RunId::from("nope")).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryCheckpointer::new();
        let state = awaiting_state();
        store
            .put(&snapshot(&state, CheckpointPosition::Running { last_step: "x".into() }).unwrap())
            .unwrap();
        let loaded = store.get(state.run_id()).unwrap().unwrap();
        assert!(matches!(loaded.position, CheckpointPosition::Running { .. }));
    }
}
