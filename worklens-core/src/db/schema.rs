//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Raw signals (short retention horizon)
    -- ============================================

    CREATE TABLE IF NOT EXISTS shell_commands (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        command           TEXT NOT NULL,
        sanitized_command TEXT NOT NULL,
        pwd               TEXT NOT NULL,
        sanitized_pwd     TEXT NOT NULL,
        ts                TEXT NOT NULL,
        duration          REAL NOT NULL,
        exit_code         INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_shell_commands_ts ON shell_commands(ts);

    CREATE TABLE IF NOT EXISTS process_samples (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        ts          TEXT NOT NULL,
        name        TEXT NOT NULL,
        pid         INTEGER NOT NULL,
        cpu_percent REAL NOT NULL,
        memory_mb   REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_process_samples_ts ON process_samples(ts);

    CREATE TABLE IF NOT EXISTS git_contexts (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        ts          TEXT NOT NULL,
        repo_path   TEXT NOT NULL,
        branch      TEXT NOT NULL,
        branch_kind TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_git_contexts_ts ON git_contexts(ts);

    CREATE TABLE IF NOT EXISTS file_events (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        ts             TEXT NOT NULL,
        path           TEXT NOT NULL,
        sanitized_path TEXT NOT NULL,
        kind           TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_events_ts ON file_events(ts);

    -- ============================================
    -- Derived records (long retention horizon)
    -- ============================================

    CREATE TABLE IF NOT EXISTS aggregated_events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        kind        TEXT NOT NULL,
        description TEXT NOT NULL,
        start_ts    TEXT NOT NULL,
        end_ts      TEXT NOT NULL,
        details     JSON
    );

    CREATE INDEX IF NOT EXISTS idx_aggregated_events_start ON aggregated_events(start_ts);
    CREATE INDEX IF NOT EXISTS idx_aggregated_events_kind ON aggregated_events(kind, start_ts);

    CREATE TABLE IF NOT EXISTS analyses (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        ts         TEXT NOT NULL,
        status     TEXT NOT NULL,
        summary    TEXT NOT NULL,
        confidence REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_analyses_ts ON analyses(ts DESC);

    CREATE TABLE IF NOT EXISTS interventions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        ts              TEXT NOT NULL,
        anomaly_kind    TEXT NOT NULL,
        trigger_context JSON NOT NULL,
        analysis        JSON NOT NULL,
        tools_used      JSON NOT NULL,
        confidence      REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_interventions_ts ON interventions(ts);

    -- ============================================
    -- Discovered directories (never deleted)
    -- ============================================

    CREATE TABLE IF NOT EXISTS discovered_dirs (
        dir_path       TEXT PRIMARY KEY,
        is_git_repo    INTEGER NOT NULL DEFAULT 0,
        access_count   INTEGER NOT NULL DEFAULT 0,
        last_access_ts TEXT NOT NULL,
        discovered_at  TEXT NOT NULL,
        is_active      INTEGER NOT NULL DEFAULT 1,
        reasoning      TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_discovered_dirs_active ON discovered_dirs(is_active);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
