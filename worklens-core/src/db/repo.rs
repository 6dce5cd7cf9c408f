//! Database repository layer
//!
//! Provides query and insert operations for all entity types. Raw entities
//! are append-only inserts; aggregated events are upserted by id;
//! discovered directories are upserted by path. No multi-row transactions
//! are needed — each entity's consistency is local to itself.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Tables pruned at the raw retention horizon, with their time column
const RAW_TABLES: &[(&str, &str)] = &[
    ("shell_commands", "ts"),
    ("process_samples", "ts"),
    ("file_events", "ts"),
    ("git_contexts", "ts"),
];

/// Tables pruned at the derived retention horizon, with their time column
const DERIVED_TABLES: &[(&str, &str)] = &[
    ("aggregated_events", "start_ts"),
    ("analyses", "ts"),
    ("interventions", "ts"),
];

/// Serialize a timestamp for storage (fixed-width so string order is time order)
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now on corruption
fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Database handle (single pooled connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for concurrency between the pipeline tasks
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Raw inserts (append-only, best-effort)
    // ============================================

    /// Insert a shell command record
    pub fn insert_command(&self, event: &CommandEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO shell_commands
                (command, sanitized_command, pwd, sanitized_pwd, ts, duration, exit_code)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.command,
                event.sanitized_command,
                event.pwd,
                event.sanitized_pwd,
                ts_to_sql(event.ts),
                event.duration,
                event.exit_code,
            ],
        )?;
        Ok(())
    }

    /// Insert a process sample record
    pub fn insert_process_sample(&self, sample: &ProcessSample) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO process_samples (ts, name, pid, cpu_percent, memory_mb)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                ts_to_sql(sample.ts),
                sample.name,
                sample.pid,
                sample.cpu_percent,
                sample.memory_mb,
            ],
        )?;
        Ok(())
    }

    /// Insert a git context record
    pub fn insert_git_context(&self, ctx: &GitContext) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO git_contexts (ts, repo_path, branch, branch_kind)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                ts_to_sql(ctx.ts),
                ctx.repo_path,
                ctx.branch,
                ctx.branch_kind.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Insert a file event record
    pub fn insert_file_event(&self, event: &FileEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO file_events (ts, path, sanitized_path, kind)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                ts_to_sql(event.ts),
                event.path,
                event.sanitized_path,
                event.kind.as_str(),
            ],
        )?;
        Ok(())
    }

    // ============================================
    // Aggregated events (upsert by id)
    // ============================================

    /// Insert a new aggregated event, returning its id
    pub fn insert_aggregated_event(
        &self,
        kind: AggregateKind,
        description: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        details: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO aggregated_events (kind, description, start_ts, end_ts, details)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                kind.as_str(),
                description,
                ts_to_sql(start_ts),
                ts_to_sql(end_ts),
                details.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Extend an open aggregated event (single-row update keyed by id)
    pub fn update_aggregated_event(
        &self,
        id: i64,
        end_ts: DateTime<Utc>,
        description: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE aggregated_events
            SET end_ts = ?2, description = ?3, details = ?4
            WHERE id = ?1
            "#,
            params![id, ts_to_sql(end_ts), description, details.to_string()],
        )?;
        Ok(())
    }

    /// Aggregated events whose interval starts within the range, newest first
    pub fn aggregated_events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AggregatedEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, kind, description, start_ts, end_ts, details
            FROM aggregated_events
            WHERE start_ts >= ?1 AND start_ts < ?2
            ORDER BY start_ts DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![ts_to_sql(start), ts_to_sql(end), limit as i64],
            Self::row_to_aggregated,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// All aggregated events of one kind, oldest first
    pub fn aggregated_events_by_kind(&self, kind: AggregateKind) -> Result<Vec<AggregatedEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, kind, description, start_ts, end_ts, details
            FROM aggregated_events
            WHERE kind = ?1
            ORDER BY start_ts
            "#,
        )?;
        let rows = stmt.query_map([kind.as_str()], Self::row_to_aggregated)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_aggregated(row: &Row) -> rusqlite::Result<AggregatedEvent> {
        let kind_str: String = row.get("kind")?;
        let start_str: String = row.get("start_ts")?;
        let end_str: String = row.get("end_ts")?;
        let details_str: Option<String> = row.get("details")?;

        Ok(AggregatedEvent {
            id: row.get("id")?,
            kind: AggregateKind::from_str(&kind_str).unwrap_or(AggregateKind::ErrorLoop),
            description: row.get("description")?,
            start_ts: ts_from_sql(&start_str),
            end_ts: ts_from_sql(&end_str),
            details: details_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }

    // ============================================
    // Analyses
    // ============================================

    /// Insert a classification result, returning its id
    pub fn insert_analysis(
        &self,
        ts: DateTime<Utc>,
        status: WorkStatus,
        summary: &str,
        confidence: f64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO analyses (ts, status, summary, confidence)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![ts_to_sql(ts), status.as_str(), summary, confidence],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent classification result, if any
    pub fn latest_analysis(&self) -> Result<Option<Analysis>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT id, ts, status, summary, confidence
            FROM analyses
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
            [],
            Self::row_to_analysis,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All analyses, oldest first (for reporting and tests)
    pub fn list_analyses(&self) -> Result<Vec<Analysis>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts, status, summary, confidence FROM analyses ORDER BY ts, id",
        )?;
        let rows = stmt.query_map([], Self::row_to_analysis)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_analysis(row: &Row) -> rusqlite::Result<Analysis> {
        let ts_str: String = row.get("ts")?;
        let status_str: String = row.get("status")?;

        Ok(Analysis {
            id: row.get("id")?,
            ts: ts_from_sql(&ts_str),
            status: WorkStatus::from_str(&status_str).unwrap_or(WorkStatus::Unknown),
            summary: row.get("summary")?,
            confidence: row.get("confidence")?,
        })
    }

    // ============================================
    // Interventions
    // ============================================

    /// Insert an anomaly intervention record, returning its id
    pub fn insert_intervention(
        &self,
        ts: DateTime<Utc>,
        anomaly: AnomalyKind,
        trigger_context: &serde_json::Value,
        analysis: &serde_json::Value,
        tools_used: &[String],
        confidence: f64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO interventions
                (ts, anomaly_kind, trigger_context, analysis, tools_used, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                ts_to_sql(ts),
                anomaly.as_str(),
                trigger_context.to_string(),
                analysis.to_string(),
                serde_json::to_string(tools_used)?,
                confidence,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All interventions, oldest first
    pub fn list_interventions(&self) -> Result<Vec<Intervention>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, ts, anomaly_kind, trigger_context, analysis, tools_used, confidence
            FROM interventions
            ORDER BY ts, id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let ts_str: String = row.get("ts")?;
            let kind_str: String = row.get("anomaly_kind")?;
            let trigger_str: String = row.get("trigger_context")?;
            let analysis_str: String = row.get("analysis")?;
            let tools_str: String = row.get("tools_used")?;

            Ok(Intervention {
                id: row.get("id")?,
                ts: ts_from_sql(&ts_str),
                anomaly: AnomalyKind::from_str(&kind_str).unwrap_or(AnomalyKind::ErrorLoop),
                trigger_context: serde_json::from_str(&trigger_str)
                    .unwrap_or(serde_json::Value::Null),
                analysis: serde_json::from_str(&analysis_str).unwrap_or(serde_json::Value::Null),
                tools_used: serde_json::from_str(&tools_str).unwrap_or_default(),
                confidence: row.get("confidence")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Discovered directories (upsert by path)
    // ============================================

    /// Record an observation of a directory.
    ///
    /// Creates the row on first sight; afterwards increments access_count,
    /// refreshes last_access_ts, and reactivates the directory. The git flag
    /// is sticky — once a repo, always a repo.
    pub fn touch_discovered_dir(
        &self,
        path: &str,
        is_git_repo: bool,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO discovered_dirs
                (dir_path, is_git_repo, access_count, last_access_ts, discovered_at, is_active)
            VALUES (?1, ?2, 1, ?3, ?3, 1)
            ON CONFLICT(dir_path) DO UPDATE SET
                access_count = access_count + 1,
                last_access_ts = excluded.last_access_ts,
                is_git_repo = MAX(is_git_repo, excluded.is_git_repo),
                is_active = 1
            "#,
            params![path, is_git_repo as i32, ts_to_sql(ts)],
        )?;
        Ok(())
    }

    /// Attach reasoning text to a discovered directory
    pub fn set_dir_reasoning(&self, path: &str, reasoning: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE discovered_dirs SET reasoning = ?2 WHERE dir_path = ?1",
            params![path, reasoning],
        )?;
        Ok(())
    }

    /// Fetch one discovered directory by path
    pub fn get_discovered_dir(&self, path: &str) -> Result<Option<DiscoveredDir>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM discovered_dirs WHERE dir_path = ?1",
            [path],
            Self::row_to_dir,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All active discovered directories
    pub fn active_dirs(&self) -> Result<Vec<DiscoveredDir>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM discovered_dirs WHERE is_active = 1 ORDER BY access_count DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_dir)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// The best directories to watch: git repos first, then by access count
    pub fn watch_candidates(&self, limit: usize) -> Result<Vec<DiscoveredDir>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM discovered_dirs
            WHERE is_active = 1
            ORDER BY is_git_repo DESC, access_count DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], Self::row_to_dir)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Deactivate directories unused since the cutoff. Returns how many.
    pub fn deactivate_stale_dirs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE discovered_dirs SET is_active = 0 WHERE is_active = 1 AND last_access_ts < ?1",
            [ts_to_sql(cutoff)],
        )?;
        Ok(n)
    }

    fn row_to_dir(row: &Row) -> rusqlite::Result<DiscoveredDir> {
        let last_access_str: String = row.get("last_access_ts")?;
        let discovered_str: String = row.get("discovered_at")?;

        Ok(DiscoveredDir {
            path: row.get("dir_path")?,
            is_git_repo: row.get::<_, i32>("is_git_repo")? != 0,
            access_count: row.get("access_count")?,
            last_access_ts: ts_from_sql(&last_access_str),
            discovered_at: ts_from_sql(&discovered_str),
            is_active: row.get::<_, i32>("is_active")? != 0,
            reasoning: row.get("reasoning")?,
        })
    }

    // ============================================
    // Range queries (reporting / snapshot surface)
    // ============================================

    /// Shell commands in a time range, newest first
    pub fn commands_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CommandEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT command, sanitized_command, pwd, sanitized_pwd, ts, duration, exit_code
            FROM shell_commands
            WHERE ts >= ?1 AND ts < ?2
            ORDER BY ts DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![ts_to_sql(start), ts_to_sql(end), limit as i64],
            |row| {
                let ts_str: String = row.get("ts")?;
                Ok(CommandEvent {
                    command: row.get("command")?,
                    sanitized_command: row.get("sanitized_command")?,
                    pwd: row.get("pwd")?,
                    sanitized_pwd: row.get("sanitized_pwd")?,
                    ts: ts_from_sql(&ts_str),
                    duration: row.get("duration")?,
                    exit_code: row.get("exit_code")?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// File events in a time range, newest first
    pub fn file_events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FileEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT ts, path, sanitized_path, kind
            FROM file_events
            WHERE ts >= ?1 AND ts < ?2
            ORDER BY ts DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![ts_to_sql(start), ts_to_sql(end), limit as i64],
            |row| {
                let ts_str: String = row.get("ts")?;
                let kind_str: String = row.get("kind")?;
                Ok(FileEvent {
                    ts: ts_from_sql(&ts_str),
                    path: row.get("path")?,
                    sanitized_path: row.get("sanitized_path")?,
                    kind: FileEventKind::from_str(&kind_str).unwrap_or(FileEventKind::Modified),
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Git contexts in a time range, newest first
    pub fn git_contexts_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GitContext>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT ts, repo_path, branch, branch_kind
            FROM git_contexts
            WHERE ts >= ?1 AND ts < ?2
            ORDER BY ts DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![ts_to_sql(start), ts_to_sql(end), limit as i64],
            |row| {
                let ts_str: String = row.get("ts")?;
                let kind_str: String = row.get("branch_kind")?;
                Ok(GitContext {
                    ts: ts_from_sql(&ts_str),
                    repo_path: row.get("repo_path")?,
                    branch: row.get("branch")?,
                    branch_kind: BranchKind::from_str(&kind_str).unwrap_or(BranchKind::Other),
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Distinct process names seen in a time range
    pub fn process_names_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT name
            FROM process_samples
            WHERE ts >= ?1 AND ts < ?2
            ORDER BY name
            "#,
        )?;
        let rows = stmt.query_map(params![ts_to_sql(start), ts_to_sql(end)], |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Retention
    // ============================================

    /// Delete raw rows older than the cutoff, one table at a time.
    ///
    /// Each table is an independent operation: a failure is reported per
    /// table and does not abort the others.
    pub fn prune_raw(&self, cutoff: DateTime<Utc>) -> Vec<(&'static str, Result<usize>)> {
        RAW_TABLES
            .iter()
            .map(|(table, col)| (*table, self.prune_table(table, col, cutoff)))
            .collect()
    }

    /// Delete derived rows older than the cutoff, one table at a time.
    pub fn prune_derived(&self, cutoff: DateTime<Utc>) -> Vec<(&'static str, Result<usize>)> {
        DERIVED_TABLES
            .iter()
            .map(|(table, col)| (*table, self.prune_table(table, col, cutoff)))
            .collect()
    }

    fn prune_table(&self, table: &str, time_column: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        // Table and column names come from the compile-time lists above.
        let sql = format!("DELETE FROM {} WHERE {} < ?1", table, time_column);
        let n = conn.execute(&sql, [ts_to_sql(cutoff)])?;
        Ok(n)
    }
}
