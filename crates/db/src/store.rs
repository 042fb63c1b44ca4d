use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use thiserror::Error;

use statecraft_core::{MachineId, State, TaskId};

use crate::connection::{connect, connect_pinned};
use crate::{migrations, DbPool};

/// All connections named `:memory:` with a shared cache see the same
/// process-wide database, so independently built machines can share it.
const IN_MEMORY_URL: &str = "sqlite::memory:?cache=shared";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub machine_id: MachineId,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionStatus {
    Pending,
    Committed,
    Failed,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of a task's append-only transition log. The row with the highest
/// `seq` and committed status defines the task's current state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    pub task_id: TaskId,
    pub seq: i64,
    pub from_state: State,
    pub to_state: State,
    pub payload: Vec<u8>,
    pub attempt: u32,
    pub status: TransitionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct NewTransition<'a> {
    pub task_id: TaskId,
    pub from_state: &'a State,
    pub to_state: &'a State,
    pub payload: &'a [u8],
    pub attempt: u32,
    pub status: TransitionStatus,
}

/// Persistence boundary for machines, tasks, and the transition log.
///
/// Implementations must be safe under concurrent use from every worker pool;
/// the executor serializes nothing on its side.
#[async_trait]
pub trait Store: Send + Sync {
    /// Registers a machine name, returning the existing id if present.
    async fn create_machine(&self, name: &str) -> Result<MachineId, StoreError>;

    async fn create_task(
        &self,
        machine_id: MachineId,
        payload: &[u8],
    ) -> Result<TaskRecord, StoreError>;

    /// Tasks of the machine whose effective state is not in
    /// `terminal_states`. Which states are terminal is schema knowledge, so
    /// the caller supplies the set.
    async fn list_open_tasks(
        &self,
        machine_id: MachineId,
        terminal_states: &[State],
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn current_state(&self, task_id: TaskId) -> Result<Option<State>, StoreError>;

    async fn last_committed_transition(
        &self,
        task_id: TaskId,
    ) -> Result<Option<TransitionRecord>, StoreError>;

    async fn record_transition(&self, transition: NewTransition<'_>) -> Result<(), StoreError>;

    /// Number of prior failed attempts landing at `to_state`.
    async fn attempts_at(&self, task_id: TaskId, to_state: &State) -> Result<u32, StoreError>;

    /// Full audit log for a task, oldest first.
    async fn transitions_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TransitionRecord>, StoreError>;
}

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) a database file, creating parent
    /// directories first, and applies pending migrations.
    pub async fn on_disk(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = connect(&url).await?;
        migrations::run_pending(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Process-wide shared in-memory database, migrated on open. Safe to
    /// open from several machines concurrently.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = connect_pinned(IN_MEMORY_URL, 5, 30).await?;
        migrations::run_pending(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_machine(&self, name: &str) -> Result<MachineId, StoreError> {
        sqlx::query("INSERT INTO machine (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        let id = sqlx::query("SELECT id FROM machine WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("id");

        Ok(MachineId(id))
    }

    async fn create_task(
        &self,
        machine_id: MachineId,
        payload: &[u8],
    ) -> Result<TaskRecord, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query("INSERT INTO task (machine_id, payload, created_at) VALUES (?, ?, ?)")
            .bind(machine_id.as_i64())
            .bind(payload)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|error| map_conflict(error, "task"))?;

        Ok(TaskRecord {
            id: TaskId(result.last_insert_rowid()),
            machine_id,
            payload: payload.to_vec(),
            created_at,
        })
    }

    async fn list_open_tasks(
        &self,
        machine_id: MachineId,
        terminal_states: &[State],
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = if terminal_states.is_empty() {
            sqlx::query(
                "SELECT id, machine_id, payload, created_at
                 FROM task
                 WHERE machine_id = ?
                 ORDER BY id ASC",
            )
            .bind(machine_id.as_i64())
            .fetch_all(&self.pool)
            .await?
        } else {
            let placeholders = vec!["?"; terminal_states.len()].join(", ");
            let sql = format!(
                "SELECT t.id, t.machine_id, t.payload, t.created_at
                 FROM task t
                 WHERE t.machine_id = ?
                   AND COALESCE(
                         (SELECT tr.to_state
                          FROM transition tr
                          WHERE tr.task_id = t.id AND tr.status = 'committed'
                          ORDER BY tr.seq DESC
                          LIMIT 1),
                         '__initial__'
                       ) NOT IN ({placeholders})
                 ORDER BY t.id ASC"
            );

            let mut query = sqlx::query(&sql).bind(machine_id.as_i64());
            for state in terminal_states {
                query = query.bind(state.as_str());
            }
            query.fetch_all(&self.pool).await?
        };

        rows.into_iter().map(task_from_row).collect()
    }

    async fn current_state(&self, task_id: TaskId) -> Result<Option<State>, StoreError> {
        let row = sqlx::query(
            "SELECT to_state
             FROM transition
             WHERE task_id = ? AND status = 'committed'
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(task_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| State::new(row.get::<String, _>("to_state"))))
    }

    async fn last_committed_transition(
        &self,
        task_id: TaskId,
    ) -> Result<Option<TransitionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, seq, from_state, to_state, payload, attempt, status, created_at
             FROM transition
             WHERE task_id = ? AND status = 'committed'
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(task_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(transition_from_row).transpose()
    }

    async fn record_transition(&self, transition: NewTransition<'_>) -> Result<(), StoreError> {
        // Seq is allocated inside the insert statement; sequences are
        // independent per task.
        sqlx::query(
            "INSERT INTO transition (task_id, seq, from_state, to_state, payload, attempt, status, created_at)
             VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM transition WHERE task_id = ?), ?, ?, ?, ?, ?, ?)",
        )
        .bind(transition.task_id.as_i64())
        .bind(transition.task_id.as_i64())
        .bind(transition.from_state.as_str())
        .bind(transition.to_state.as_str())
        .bind(transition.payload)
        .bind(i64::from(transition.attempt))
        .bind(transition.status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|error| map_conflict(error, "transition"))?;

        Ok(())
    }

    async fn attempts_at(&self, task_id: TaskId, to_state: &State) -> Result<u32, StoreError> {
        let count = sqlx::query(
            "SELECT COUNT(*) AS count
             FROM transition
             WHERE task_id = ? AND to_state = ? AND status = 'failed'",
        )
        .bind(task_id.as_i64())
        .bind(to_state.as_str())
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("count");

        parse_u32("count", count)
    }

    async fn transitions_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, seq, from_state, to_state, payload, attempt, status, created_at
             FROM transition
             WHERE task_id = ?
             ORDER BY seq ASC",
        )
        .bind(task_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

fn map_conflict(error: sqlx::Error, what: &str) -> StoreError {
    match &error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            StoreError::AlreadyExists(what.to_string())
        }
        _ => StoreError::Database(error),
    }
}

fn task_from_row(row: SqliteRow) -> Result<TaskRecord, StoreError> {
    Ok(TaskRecord {
        id: TaskId(row.try_get("id")?),
        machine_id: MachineId(row.try_get("machine_id")?),
        payload: row.try_get("payload")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<TransitionRecord, StoreError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = TransitionStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown transition status `{status_raw}`")))?;

    Ok(TransitionRecord {
        task_id: TaskId(row.try_get("task_id")?),
        seq: row.try_get("seq")?,
        from_state: State::new(row.try_get::<String, _>("from_state")?),
        to_state: State::new(row.try_get::<String, _>("to_state")?),
        payload: row.try_get("payload")?,
        attempt: parse_u32("attempt", row.try_get("attempt")?)?,
        status,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| {
        StoreError::Decode(format!("invalid value for `{column}` (expected non-negative u32): {value}"))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| {
            StoreError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        })
}

#[cfg(test)]
mod tests {
    use statecraft_core::{State, TaskId};

    use super::{NewTransition, SqliteStore, Store, TransitionStatus};

    const DONE: State = State::from_static("Done");
    const ERROR: State = State::from_static("Error");

    async fn record(
        store: &SqliteStore,
        task_id: TaskId,
        from: &State,
        to: &State,
        attempt: u32,
        status: TransitionStatus,
    ) {
        store
            .record_transition(NewTransition {
                task_id,
                from_state: from,
                to_state: to,
                payload: b"[]",
                attempt,
                status,
            })
            .await
            .expect("record transition");
    }

    #[tokio::test]
    async fn machine_creation_is_idempotent_by_name() {
        let store = SqliteStore::in_memory().await.expect("open store");

        let first = store.create_machine("idempotent-machine").await.expect("create");
        let second = store.create_machine("idempotent-machine").await.expect("create again");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn new_task_has_no_state_until_a_transition_commits() {
        let store = SqliteStore::in_memory().await.expect("open store");
        let machine = store.create_machine("stateless-task-machine").await.expect("machine");

        let task = store.create_task(machine, b"[1]").await.expect("task");

        assert_eq!(store.current_state(task.id).await.expect("state"), None);
        assert_eq!(store.last_committed_transition(task.id).await.expect("last"), None);
    }

    #[tokio::test]
    async fn last_committed_transition_ignores_failed_rows() {
        let store = SqliteStore::in_memory().await.expect("open store");
        let machine = store.create_machine("failed-rows-machine").await.expect("machine");
        let task = store.create_task(machine, b"[]").await.expect("task");

        let entry = State::from_static("CreateRecord");
        let next = State::from_static("CloneRepo");
        record(&store, task.id, &State::INITIAL, &entry, 0, TransitionStatus::Committed).await;
        record(&store, task.id, &entry, &next, 1, TransitionStatus::Failed).await;

        let last = store
            .last_committed_transition(task.id)
            .await
            .expect("query")
            .expect("committed row");
        assert_eq!(last.to_state, entry);
        assert_eq!(last.seq, 1);

        assert_eq!(store.current_state(task.id).await.expect("state"), Some(entry));
    }

    #[tokio::test]
    async fn attempts_count_only_failed_rows_at_the_target() {
        let store = SqliteStore::in_memory().await.expect("open store");
        let machine = store.create_machine("attempts-machine").await.expect("machine");
        let task = store.create_task(machine, b"[]").await.expect("task");

        let entry = State::from_static("CreateRecord");
        record(&store, task.id, &State::INITIAL, &entry, 1, TransitionStatus::Failed).await;
        record(&store, task.id, &State::INITIAL, &entry, 2, TransitionStatus::Failed).await;
        record(&store, task.id, &State::INITIAL, &entry, 2, TransitionStatus::Committed).await;

        assert_eq!(store.attempts_at(task.id, &entry).await.expect("attempts"), 2);
        assert_eq!(store.attempts_at(task.id, &DONE).await.expect("attempts"), 0);
    }

    #[tokio::test]
    async fn open_tasks_exclude_terminal_states() {
        let store = SqliteStore::in_memory().await.expect("open store");
        let machine = store.create_machine("open-tasks-machine").await.expect("machine");

        let fresh = store.create_task(machine, b"[]").await.expect("task");
        let in_flight = store.create_task(machine, b"[]").await.expect("task");
        let finished = store.create_task(machine, b"[]").await.expect("task");

        let entry = State::from_static("CreateRecord");
        record(&store, in_flight.id, &State::INITIAL, &entry, 0, TransitionStatus::Committed).await;
        record(&store, finished.id, &State::INITIAL, &entry, 0, TransitionStatus::Committed).await;
        record(&store, finished.id, &entry, &DONE, 0, TransitionStatus::Committed).await;

        let open = store
            .list_open_tasks(machine, &[DONE, ERROR])
            .await
            .expect("list open");
        let ids: Vec<TaskId> = open.iter().map(|task| task.id).collect();

        assert_eq!(ids, vec![fresh.id, in_flight.id]);
    }

    #[tokio::test]
    async fn transition_log_is_ordered_and_sequenced_per_task() {
        let store = SqliteStore::in_memory().await.expect("open store");
        let machine = store.create_machine("log-order-machine").await.expect("machine");
        let task = store.create_task(machine, b"[]").await.expect("task");
        let other = store.create_task(machine, b"[]").await.expect("task");

        let entry = State::from_static("CreateRecord");
        record(&store, task.id, &State::INITIAL, &entry, 0, TransitionStatus::Committed).await;
        record(&store, other.id, &State::INITIAL, &entry, 0, TransitionStatus::Committed).await;
        record(&store, task.id, &entry, &DONE, 0, TransitionStatus::Committed).await;

        let log = store.transitions_for_task(task.id).await.expect("log");
        let seqs: Vec<i64> = log.iter().map(|row| row.seq).collect();
        let path: Vec<&str> = log.iter().map(|row| row.to_state.as_str()).collect();

        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(path, vec!["CreateRecord", "Done"]);

        let other_log = store.transitions_for_task(other.id).await.expect("log");
        assert_eq!(other_log.len(), 1);
        assert_eq!(other_log[0].seq, 1);
    }

    #[tokio::test]
    async fn on_disk_store_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/data/statecraft.db");

        let store = SqliteStore::on_disk(&path).await.expect("open on-disk store");
        let machine = store.create_machine("disk-machine").await.expect("machine");
        store.create_task(machine, b"[]").await.expect("task");

        assert!(path.exists());
    }

    #[tokio::test]
    async fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("statecraft.db");

        let machine = {
            let store = SqliteStore::on_disk(&path).await.expect("open");
            let machine = store.create_machine("reopen-machine").await.expect("machine");
            store.create_task(machine, b"[7]").await.expect("task");
            store.pool().close().await;
            machine
        };

        let store = SqliteStore::on_disk(&path).await.expect("reopen");
        let open = store.list_open_tasks(machine, &[DONE]).await.expect("list");

        assert_eq!(open.len(), 1);
        assert_eq!(open[0].payload, b"[7]".to_vec());
    }
}
