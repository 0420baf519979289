use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::LocalPersistence;
use crate::security::ensure_owner_only_file;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE task_sessions (
    task_id     TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL UNIQUE,
    mapped_at   TEXT NOT NULL
);

CREATE TABLE kv_state (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

const LAST_SESSION_KEY: &str = "last_session_id";

#[derive(Debug)]
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state db parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open state db at `{}`", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for state db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;
        ensure_owner_only_file(path)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("failed to open in-memory state db")?;
        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&*self.lock()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("state db connection lock poisoned"))
    }
}

impl LocalPersistence for SqlitePersistence {
    fn last_session_id(&self) -> Result<Option<String>> {
        self.lock()?
            .query_row("SELECT value FROM kv_state WHERE key = ?1", params![LAST_SESSION_KEY], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .context("failed to read last session id")
    }

    fn set_last_session_id(&self, session_id: &str) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![LAST_SESSION_KEY, session_id],
            )
            .context("failed to write last session id")?;
        Ok(())
    }

    fn session_for_task(&self, task_id: &str) -> Result<Option<String>> {
        self.lock()?
            .query_row(
                "SELECT session_id FROM task_sessions WHERE task_id = ?1",
                params![task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read task session mapping")
    }

    fn task_for_session(&self, session_id: &str) -> Result<Option<String>> {
        self.lock()?
            .query_row(
                "SELECT task_id FROM task_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read session task mapping")
    }

    fn set_task_session(&self, task_id: &str, session_id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("failed to start mapping transaction")?;
        tx.execute(
            "DELETE FROM task_sessions WHERE session_id = ?1 AND task_id <> ?2",
            params![session_id, task_id],
        )
        .context("failed to drop stale session mapping")?;
        tx.execute(
            "INSERT INTO task_sessions (task_id, session_id, mapped_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(task_id) DO UPDATE SET session_id = excluded.session_id, mapped_at = excluded.mapped_at",
            params![task_id, session_id],
        )
        .context("failed to write task session mapping")?;
        tx.commit().context("failed to commit task session mapping")?;
        Ok(())
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply state db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
