use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

/// Embedded baseline schema for the machine, task, and transition tables.
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Brings an opened database up to the current schema. Both store factories
/// call this, and independently built machines may open the same database
/// at once; the migrator's journal table serializes those runs, so repeat
/// application is a no-op.
pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{run_pending, MIGRATOR};
    use crate::connect_with_settings;

    async fn table_count(pool: &crate::DbPool, name: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(pool)
            .await
            .expect("check table")
            .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        assert_eq!(table_count(&pool, "machine").await, 1);
        assert_eq!(table_count(&pool, "task").await, 1);
        assert_eq!(table_count(&pool, "transition").await, 1);
    }

    #[tokio::test]
    async fn reapplying_migrations_is_a_no_op() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run");

        assert_eq!(table_count(&pool, "machine").await, 1);
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        assert_eq!(table_count(&pool, "machine").await, 0);
        assert_eq!(table_count(&pool, "transition").await, 0);
    }
}
