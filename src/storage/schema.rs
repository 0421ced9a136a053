//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS studies (
            id INTEGER PRIMARY KEY,
            object_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS researchers (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            is_batch_user INTEGER NOT NULL DEFAULT 0,
            password_hash TEXT,
            access_key_id TEXT UNIQUE,
            access_key_secret TEXT,
            access_key_secret_salt TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS study_relations (
            id INTEGER PRIMARY KEY,
            study_id INTEGER NOT NULL,
            researcher_id INTEGER NOT NULL,
            relationship TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (study_id, researcher_id),
            FOREIGN KEY (study_id) REFERENCES studies(id),
            FOREIGN KEY (researcher_id) REFERENCES researchers(id)
        );

        CREATE TABLE IF NOT EXISTS pipeline_executions (
            id INTEGER PRIMARY KEY,
            owner TEXT NOT NULL,
            study_id INTEGER NOT NULL,
            requested_at TEXT NOT NULL,
            email_addresses_json TEXT NOT NULL DEFAULT '[]',
            data_start TEXT,
            data_end TEXT,
            participants_json TEXT NOT NULL DEFAULT '[]',
            datastreams_json TEXT NOT NULL DEFAULT '[]',
            job_type TEXT NOT NULL,
            box_directory TEXT,
            batch_job_id TEXT,
            status TEXT NOT NULL,
            error_text TEXT,
            started_at TEXT,
            finished_at TEXT,
            execution_minutes REAL,
            FOREIGN KEY (study_id) REFERENCES studies(id)
        );

        CREATE INDEX IF NOT EXISTS idx_pipeline_executions_study ON pipeline_executions(study_id);
        CREATE INDEX IF NOT EXISTS idx_pipeline_executions_status ON pipeline_executions(status);
        CREATE INDEX IF NOT EXISTS idx_study_relations_researcher ON study_relations(researcher_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
