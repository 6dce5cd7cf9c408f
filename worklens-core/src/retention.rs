//! Scheduled data retention
//!
//! Raw telemetry is short-lived; derived records live longer; discovered
//! directories are never deleted, only deactivated. Each table's cleanup is
//! an independent best-effort delete — a failure is logged and retried on
//! the next run, without blocking the other tables.

use crate::config::RetentionConfig;
use crate::db::Database;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Counters from one retention pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub raw_deleted: usize,
    pub derived_deleted: usize,
    pub dirs_deactivated: usize,
    pub failed_tables: usize,
}

/// The scheduled pruning job
pub struct RetentionManager {
    db: Arc<Database>,
    cfg: RetentionConfig,
}

impl RetentionManager {
    pub fn new(db: Arc<Database>, cfg: RetentionConfig) -> Self {
        Self { db, cfg }
    }

    /// One retention pass at the given time.
    pub fn run_once(&self, now: DateTime<Utc>) -> RetentionReport {
        let raw_cutoff = now - Duration::days(self.cfg.raw_days as i64);
        let derived_cutoff = now - Duration::days(self.cfg.derived_days as i64);
        let dir_cutoff = now - Duration::days(self.cfg.dir_inactive_days as i64);

        let mut report = RetentionReport::default();

        for (table, result) in self.db.prune_raw(raw_cutoff) {
            match result {
                Ok(n) => {
                    report.raw_deleted += n;
                    if n > 0 {
                        tracing::info!(table, deleted = n, "Pruned raw records");
                    }
                }
                Err(e) => {
                    report.failed_tables += 1;
                    tracing::warn!(table, error = %e, "Raw prune failed, will retry next run");
                }
            }
        }

        for (table, result) in self.db.prune_derived(derived_cutoff) {
            match result {
                Ok(n) => {
                    report.derived_deleted += n;
                    if n > 0 {
                        tracing::info!(table, deleted = n, "Pruned derived records");
                    }
                }
                Err(e) => {
                    report.failed_tables += 1;
                    tracing::warn!(table, error = %e, "Derived prune failed, will retry next run");
                }
            }
        }

        match self.db.deactivate_stale_dirs(dir_cutoff) {
            Ok(n) => {
                report.dirs_deactivated = n;
                if n > 0 {
                    tracing::info!(deactivated = n, "Deactivated stale directories");
                }
            }
            Err(e) => {
                report.failed_tables += 1;
                tracing::warn!(error = %e, "Directory deactivation failed");
            }
        }

        report
    }

    /// Run at the configured cadence until shutdown. The first pass happens
    /// one full interval after startup.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.cfg.cadence_hours as u64 * 3600);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(cadence_hours = self.cfg.cadence_hours, "Retention manager started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.run_once(Utc::now());
                    tracing::debug!(?report, "Retention pass complete");
                }
            }
        }

        tracing::info!("Retention manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn test_db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    }

    fn command_aged(now: DateTime<Utc>, age_days: i64) -> CommandEvent {
        CommandEvent {
            command: "ls".into(),
            sanitized_command: "ls".into(),
            pwd: "/home/dev".into(),
            sanitized_pwd: "/home/dev".into(),
            ts: now - Duration::days(age_days),
            duration: 0.1,
            exit_code: 0,
        }
    }

    #[test]
    fn test_raw_horizon_boundary() {
        let db = test_db();
        let now = Utc::now();

        db.insert_command(&command_aged(now, 8)).unwrap();
        db.insert_command(&command_aged(now, 6)).unwrap();

        let manager = RetentionManager::new(db.clone(), RetentionConfig::default());
        let report = manager.run_once(now);

        assert_eq!(report.raw_deleted, 1);
        assert_eq!(report.failed_tables, 0);

        let kept = db
            .commands_in_range(now - Duration::days(30), now, 50)
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_derived_horizon() {
        let db = test_db();
        let now = Utc::now();

        db.insert_analysis(now - Duration::days(31), WorkStatus::Coding, "ancient", 0.9)
            .unwrap();
        db.insert_analysis(now - Duration::days(5), WorkStatus::Coding, "recent", 0.9)
            .unwrap();
        db.insert_aggregated_event(
            AggregateKind::GitBurst,
            "old burst",
            now - Duration::days(40),
            now - Duration::days(40) + Duration::minutes(5),
            &serde_json::json!({}),
        )
        .unwrap();

        let manager = RetentionManager::new(db.clone(), RetentionConfig::default());
        let report = manager.run_once(now);

        assert_eq!(report.derived_deleted, 2);
        let remaining = db.list_analyses().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].summary, "recent");
    }

    #[test]
    fn test_dirs_deactivated_not_deleted() {
        let db = test_db();
        let now = Utc::now();

        db.touch_discovered_dir("/stale", false, now - Duration::days(45))
            .unwrap();

        let manager = RetentionManager::new(db.clone(), RetentionConfig::default());
        let report = manager.run_once(now);

        assert_eq!(report.dirs_deactivated, 1);
        let dir = db.get_discovered_dir("/stale").unwrap().unwrap();
        assert!(!dir.is_active);
    }

    #[test]
    fn test_empty_database_reports_zero() {
        let db = test_db();
        let manager = RetentionManager::new(db, RetentionConfig::default());
        let report = manager.run_once(Utc::now());
        assert_eq!(report, RetentionReport::default());
    }
}
