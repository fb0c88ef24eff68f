//! SQLite-based state store for the scheduler.
//!
//! Writes that accompany an accepted offer happen in one transaction, and
//! the transaction commits before the operations are handed to the
//! transport.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use keel_events::{ResourceValue, TaskState};
use keel_id::{NodeId, PodInstanceName, ReservationId, TaskId};
use keel_reconcile::{SpecHash, StepIntent, StepStatus};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use thiserror::Error;
use tracing::debug;

use super::{PendingRelease, ReservationRecord, StepRecord, TaskRecord};
use crate::spec::TaskGoal;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Commits must be on disk before operations are sent
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                pod_instance TEXT NOT NULL,
                task_name TEXT NOT NULL,
                slot TEXT NOT NULL,
                resource_name TEXT NOT NULL,
                label TEXT NOT NULL UNIQUE,
                node_id TEXT NOT NULL,
                value TEXT NOT NULL,
                persistence_id TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (pod_instance, task_name, slot)
            );

            CREATE TABLE IF NOT EXISTS pending_releases (
                label TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                pod_instance TEXT NOT NULL,
                requested INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT NOT NULL UNIQUE,
                pod_instance TEXT NOT NULL,
                task_name TEXT NOT NULL,
                node_id TEXT NOT NULL,
                offer_id TEXT NOT NULL,
                goal TEXT NOT NULL,
                readiness_check INTEGER NOT NULL,
                state TEXT,
                ready INTEGER NOT NULL DEFAULT 0,
                kill_requested INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (pod_instance, task_name)
            );

            CREATE TABLE IF NOT EXISTS steps (
                plan TEXT NOT NULL,
                phase TEXT NOT NULL,
                name TEXT NOT NULL,
                position INTEGER NOT NULL,
                pod_instance TEXT NOT NULL,
                intent TEXT NOT NULL,
                status TEXT NOT NULL,
                target TEXT NOT NULL,
                errors TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (plan, phase, name)
            );

            CREATE TABLE IF NOT EXISTS plans (
                name TEXT PRIMARY KEY,
                interrupted INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS properties (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Reservations recorded for one pod instance.
    pub fn reservations_for(
        &self,
        pod: &PodInstanceName,
    ) -> Result<Vec<ReservationRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT pod_instance, task_name, slot, resource_name, label, node_id, value, persistence_id
             FROM reservations WHERE pod_instance = ?1 ORDER BY task_name, slot",
        )?;
        let records = stmt
            .query_map(params![pod.to_string()], reservation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every reservation the service owns.
    pub fn all_reservations(&self) -> Result<Vec<ReservationRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT pod_instance, task_name, slot, resource_name, label, node_id, value, persistence_id
             FROM reservations ORDER BY pod_instance, task_name, slot",
        )?;
        let records = stmt
            .query_map([], reservation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Labels of every live reservation.
    pub fn owned_labels(&self) -> Result<HashSet<ReservationId>, StateStoreError> {
        let mut stmt = self.conn.prepare("SELECT label FROM reservations")?;
        let labels = stmt
            .query_map([], |row| parsed::<ReservationId>(row, 0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(labels)
    }

    /// Drop every reservation and launch record, queueing all labels for
    /// release.
    pub fn release_all(&mut self) -> Result<usize, StateStoreError> {
        let tx = self.conn.transaction()?;
        let count = queue_release(&tx)?;
        tx.execute("DELETE FROM tasks", [])?;
        tx.commit()?;
        Ok(count)
    }

    // =========================================================================
    // Pending releases
    // =========================================================================

    pub fn pending_releases(&self) -> Result<Vec<PendingRelease>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT label, node_id, pod_instance, requested FROM pending_releases
             ORDER BY created_at, label",
        )?;
        let pending = stmt
            .query_map([], |row| {
                Ok(PendingRelease {
                    label: parsed(row, 0)?,
                    node_id: parsed(row, 1)?,
                    pod_instance: parsed(row, 2)?,
                    requested: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pending)
    }

    /// Note that UNRESERVE has been sent for `labels`.
    pub fn mark_requested(&mut self, labels: &[ReservationId]) -> Result<(), StateStoreError> {
        let tx = self.conn.transaction()?;
        for label in labels {
            tx.execute(
                "UPDATE pending_releases SET requested = 1 WHERE label = ?1",
                params![label.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Forget releases that have taken effect.
    pub fn clear_releases(&mut self, labels: &[ReservationId]) -> Result<(), StateStoreError> {
        let tx = self.conn.transaction()?;
        for label in labels {
            tx.execute(
                "DELETE FROM pending_releases WHERE label = ?1",
                params![label.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, pod_instance, task_name, node_id, offer_id, goal, readiness_check, state, ready,
                    kill_requested
             FROM tasks WHERE task_id = ?1",
        )?;
        stmt.query_row(params![task_id.to_string()], task_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Current launch records of a pod instance's tasks.
    pub fn tasks_for(&self, pod: &PodInstanceName) -> Result<Vec<TaskRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, pod_instance, task_name, node_id, offer_id, goal, readiness_check, state, ready,
                    kill_requested
             FROM tasks WHERE pod_instance = ?1 ORDER BY task_name",
        )?;
        let tasks = stmt
            .query_map(params![pod.to_string()], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Every current launch record.
    pub fn all_tasks(&self) -> Result<Vec<TaskRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, pod_instance, task_name, node_id, offer_id, goal, readiness_check, state, ready,
                    kill_requested
             FROM tasks ORDER BY pod_instance, task_name",
        )?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Note that KILL has been sent for `task_ids`.
    pub fn mark_kill_requested(&mut self, task_ids: &[TaskId]) -> Result<(), StateStoreError> {
        let tx = self.conn.transaction()?;
        for task_id in task_ids {
            tx.execute(
                "UPDATE tasks SET kill_requested = 1 WHERE task_id = ?1",
                params![task_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a status update. Returns the updated record, or `None` if the
    /// task is not a current launch.
    pub fn update_task(
        &self,
        task_id: &TaskId,
        state: TaskState,
        ready: Option<bool>,
    ) -> Result<Option<TaskRecord>, StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        let updated = self.conn.execute(
            "UPDATE tasks SET state = ?1, ready = COALESCE(?2, ready), updated_at = ?3
             WHERE task_id = ?4",
            params![state.as_str(), ready, now, task_id.to_string()],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.task(task_id)
    }

    // =========================================================================
    // Steps and plans
    // =========================================================================

    pub fn save_step(&self, step: &StepRecord) -> Result<(), StateStoreError> {
        upsert_step(&self.conn, step)
    }

    /// Every persisted step, grouped by plan and phase, in position order.
    pub fn load_steps(&self) -> Result<Vec<StepRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT plan, phase, name, position, pod_instance, intent, status, target, errors
             FROM steps ORDER BY plan, phase, position",
        )?;
        let steps = stmt
            .query_map([], |row| {
                let position: i64 = row.get(3)?;
                Ok(StepRecord {
                    plan: row.get(0)?,
                    phase: row.get(1)?,
                    name: row.get(2)?,
                    position: usize::try_from(position).unwrap_or_default(),
                    pod_instance: parsed(row, 4)?,
                    intent: enumerated(row, 5, StepIntent::parse)?,
                    status: enumerated(row, 6, StepStatus::parse)?,
                    target: SpecHash::from_stored(row.get::<_, String>(7)?),
                    errors: json(row, 8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    /// Forget every step of a plan.
    pub fn delete_steps(&self, plan: &str) -> Result<(), StateStoreError> {
        self.conn
            .execute("DELETE FROM steps WHERE plan = ?1", params![plan])?;
        Ok(())
    }

    /// Forget the steps of one phase.
    pub fn delete_phase(&self, plan: &str, phase: &str) -> Result<(), StateStoreError> {
        self.conn.execute(
            "DELETE FROM steps WHERE plan = ?1 AND phase = ?2",
            params![plan, phase],
        )?;
        Ok(())
    }

    pub fn set_interrupted(&self, plan: &str, interrupted: bool) -> Result<(), StateStoreError> {
        self.conn.execute(
            "INSERT INTO plans (name, interrupted) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET interrupted = excluded.interrupted",
            params![plan, interrupted],
        )?;
        Ok(())
    }

    /// Persisted interrupt flags, by plan name.
    pub fn plan_flags(&self) -> Result<Vec<(String, bool)>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, interrupted FROM plans ORDER BY name")?;
        let flags = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(flags)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn property(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        self.conn
            .query_row(
                "SELECT value FROM properties WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_property(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        self.conn.execute(
            "INSERT INTO properties (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // =========================================================================
    // Accepted offers
    // =========================================================================

    /// Persist everything an accepted offer changes, atomically.
    ///
    /// The pod's reservations become exactly `reservations`; labels that
    /// drop out are queued for release, marked requested when `unreserved`
    /// lists them. The pod's launch records become `tasks`.
    pub fn commit_launch(
        &mut self,
        pod: &PodInstanceName,
        reservations: &[ReservationRecord],
        unreserved: &[ReservationRecord],
        tasks: &[TaskRecord],
        step: &StepRecord,
    ) -> Result<(), StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        let tx = self.conn.transaction()?;

        let kept: HashSet<ReservationId> = reservations.iter().map(|r| r.label).collect();
        let sent: HashSet<ReservationId> = unreserved.iter().map(|r| r.label).collect();
        let previous = {
            let mut stmt = tx.prepare(
                "SELECT pod_instance, task_name, slot, resource_name, label, node_id, value, persistence_id
                 FROM reservations WHERE pod_instance = ?1",
            )?;
            let rows = stmt
                .query_map(params![pod.to_string()], reservation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for old in previous.iter().filter(|r| !kept.contains(&r.label)) {
            tx.execute(
                "INSERT OR REPLACE INTO pending_releases (label, node_id, pod_instance, requested, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    old.label.to_string(),
                    old.node_id.to_string(),
                    pod.to_string(),
                    sent.contains(&old.label),
                    now
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM reservations WHERE pod_instance = ?1",
            params![pod.to_string()],
        )?;
        for record in reservations {
            insert_reservation(&tx, record, now)?;
        }

        tx.execute(
            "DELETE FROM tasks WHERE pod_instance = ?1",
            params![pod.to_string()],
        )?;
        for task in tasks {
            tx.execute(
                "INSERT INTO tasks (task_id, pod_instance, task_name, node_id, offer_id, goal,
                                    readiness_check, state, ready, kill_requested, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.task_id.to_string(),
                    task.pod_instance.to_string(),
                    task.task_name,
                    task.node_id.to_string(),
                    task.offer_id.to_string(),
                    task.goal.as_str(),
                    task.readiness_check,
                    task.state.map(|s| s.as_str()),
                    task.ready,
                    task.kill_requested,
                    now
                ],
            )?;
        }

        upsert_step(&tx, step)?;
        tx.commit()?;
        Ok(())
    }
}

fn insert_reservation(
    tx: &Transaction<'_>,
    record: &ReservationRecord,
    now: i64,
) -> Result<(), StateStoreError> {
    tx.execute(
        "INSERT INTO reservations (pod_instance, task_name, slot, resource_name, label, node_id,
                                   value, persistence_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.pod_instance.to_string(),
            record.task_name,
            record.slot,
            record.resource_name,
            record.label.to_string(),
            record.node_id.to_string(),
            serde_json::to_string(&record.value)?,
            record.persistence_id.map(|id| id.to_string()),
            now
        ],
    )?;
    Ok(())
}

fn queue_release(tx: &Transaction<'_>) -> Result<usize, StateStoreError> {
    let now = chrono::Utc::now().timestamp();
    let queued = tx.execute(
        "INSERT OR IGNORE INTO pending_releases (label, node_id, pod_instance, requested, created_at)
         SELECT label, node_id, pod_instance, 0, ?1 FROM reservations",
        params![now],
    )?;
    tx.execute("DELETE FROM reservations", [])?;
    Ok(queued)
}

fn upsert_step(conn: &Connection, step: &StepRecord) -> Result<(), StateStoreError> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO steps (plan, phase, name, position, pod_instance, intent, status, target, errors, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(plan, phase, name) DO UPDATE SET
             position = excluded.position,
             pod_instance = excluded.pod_instance,
             intent = excluded.intent,
             status = excluded.status,
             target = excluded.target,
             errors = excluded.errors,
             updated_at = excluded.updated_at",
        params![
            step.plan,
            step.phase,
            step.name,
            i64::try_from(step.position).unwrap_or(i64::MAX),
            step.pod_instance.to_string(),
            step.intent.as_str(),
            step.status.as_str(),
            step.target.as_str(),
            serde_json::to_string(&step.errors)?,
            now
        ],
    )?;
    Ok(())
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<ReservationRecord> {
    let persistence_id: Option<String> = row.get(7)?;
    Ok(ReservationRecord {
        pod_instance: parsed(row, 0)?,
        task_name: row.get(1)?,
        slot: row.get(2)?,
        resource_name: row.get(3)?,
        label: parsed(row, 4)?,
        node_id: parsed::<NodeId>(row, 5)?,
        value: json::<ResourceValue>(row, 6)?,
        persistence_id: persistence_id
            .map(|id| id.parse().map_err(|e| conversion(7, e)))
            .transpose()?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state: Option<String> = row.get(7)?;
    let state = match state {
        Some(s) => Some(
            TaskState::parse(&s).ok_or_else(|| conversion(7, format!("unknown task state {}", s)))?,
        ),
        None => None,
    };
    Ok(TaskRecord {
        task_id: parsed(row, 0)?,
        pod_instance: parsed(row, 1)?,
        task_name: row.get(2)?,
        node_id: parsed(row, 3)?,
        offer_id: parsed(row, 4)?,
        goal: enumerated(row, 5, TaskGoal::parse)?,
        readiness_check: row.get(6)?,
        state,
        ready: row.get(8)?,
        kill_requested: row.get(9)?,
    })
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, e))
}

fn enumerated<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion(idx, format!("unexpected value {}", raw)))
}

fn json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}
