//! Event correlation and aggregation
//!
//! The correlator is the single consumer of the ingestion queue. It owns a
//! rolling in-memory window of recent events (nothing else reads or mutates
//! that state), persists raw records on arrival, and derives aggregated
//! activity episodes by running a set of independent correlation rules on
//! every tick. A tick is an event arrival or a heartbeat, whichever comes
//! first; queue reads are bounded by the heartbeat so eviction still runs
//! under low traffic.
//!
//! Rule evaluation is event-time driven (the window's newest timestamp), so
//! replaying the same stream through a fresh correlator produces the same
//! aggregated events.

mod anomaly;
mod rules;

pub use anomaly::{AnomalyDetector, InterventionRequest};
pub use rules::{default_rules, Candidate, CorrelationRule};

use crate::config::{AnomalyConfig, CorrelatorConfig};
use crate::db::Database;
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ============================================
// Window state
// ============================================

/// The rolling window of recent events, one sorted vector per kind.
///
/// Insertion keeps each vector ordered by timestamp, which tolerates the
/// modest out-of-order arrival expected across producers with skewed clocks.
#[derive(Debug, Default)]
pub struct WindowState {
    pub commands: Vec<CommandEvent>,
    pub processes: Vec<ProcessSample>,
    pub git: Vec<GitContext>,
    pub files: Vec<FileEvent>,
}

fn insert_by_ts<T>(vec: &mut Vec<T>, item: T, ts: impl Fn(&T) -> DateTime<Utc>) {
    let t = ts(&item);
    let idx = vec
        .iter()
        .rposition(|existing| ts(existing) <= t)
        .map(|i| i + 1)
        .unwrap_or(0);
    vec.insert(idx, item);
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one event in timestamp order
    pub fn insert(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::Command(e) => insert_by_ts(&mut self.commands, e, |x| x.ts),
            ObserverEvent::Process(e) => insert_by_ts(&mut self.processes, e, |x| x.ts),
            ObserverEvent::Git(e) => insert_by_ts(&mut self.git, e, |x| x.ts),
            ObserverEvent::File(e) => insert_by_ts(&mut self.files, e, |x| x.ts),
        }
    }

    /// Drop events older than the cutoff (memory only; storage keeps them)
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        self.commands.retain(|e| e.ts >= cutoff);
        self.processes.retain(|e| e.ts >= cutoff);
        self.git.retain(|e| e.ts >= cutoff);
        self.files.retain(|e| e.ts >= cutoff);
    }

    /// Newest timestamp across all kinds
    pub fn newest_ts(&self) -> Option<DateTime<Utc>> {
        [
            self.commands.last().map(|e| e.ts),
            self.processes.last().map(|e| e.ts),
            self.git.last().map(|e| e.ts),
            self.files.last().map(|e| e.ts),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.processes.is_empty()
            && self.git.is_empty()
            && self.files.is_empty()
    }
}

// ============================================
// Correlator
// ============================================

/// An aggregated event that is still growing
struct OpenEvent {
    id: i64,
    end_ts: DateTime<Utc>,
    description: String,
    details: serde_json::Value,
    /// Extension not yet persisted (flushed at most once per heartbeat)
    dirty: bool,
}

/// The correlation loop: window owner, rule runner, episode bookkeeper.
pub struct Correlator {
    db: Arc<Database>,
    window: WindowState,
    rules: Vec<Box<dyn CorrelationRule>>,
    detector: AnomalyDetector,
    open: HashMap<AggregateKind, OpenEvent>,
    last_closed_end: HashMap<AggregateKind, DateTime<Utc>>,
    intervention_tx: mpsc::Sender<InterventionRequest>,
    window_len: Duration,
    dedup_tolerance: Duration,
    merge_gap: Duration,
    heartbeat_period: std::time::Duration,
}

impl Correlator {
    pub fn new(
        db: Arc<Database>,
        cfg: &CorrelatorConfig,
        anomaly_cfg: &AnomalyConfig,
        intervention_tx: mpsc::Sender<InterventionRequest>,
    ) -> Self {
        Self {
            db,
            window: WindowState::new(),
            rules: default_rules(cfg),
            detector: AnomalyDetector::new(anomaly_cfg.clone()),
            open: HashMap::new(),
            last_closed_end: HashMap::new(),
            intervention_tx,
            window_len: Duration::seconds(cfg.window_secs as i64),
            dedup_tolerance: Duration::milliseconds(cfg.dedup_tolerance_ms as i64),
            merge_gap: Duration::seconds(cfg.merge_gap_secs as i64),
            heartbeat_period: std::time::Duration::from_secs(cfg.heartbeat_secs),
        }
    }

    /// Consume the ingestion queue until shutdown, then flush open episodes.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ObserverEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = heartbeat.tick() => self.heartbeat(Utc::now()),
                event = rx.recv() => match event {
                    Some(event) => self.ingest(event),
                    None => break,
                },
            }
        }

        // Drain what is already queued, then flush open episodes to storage.
        while let Ok(event) = rx.try_recv() {
            self.ingest(event);
        }
        self.flush();
        tracing::info!("Correlator stopped");
    }

    /// Process one normalized event: dedup, persist raw, update the window,
    /// and run a correlation tick at the event's time.
    pub fn ingest(&mut self, event: ObserverEvent) {
        if let ObserverEvent::Command(cmd) = &event {
            if self.is_duplicate(cmd) {
                tracing::trace!(command = %cmd.sanitized_command, "Dropping duplicate command");
                return;
            }
        }

        self.persist_raw(&event);
        self.observe_dirs(&event);
        self.window.insert(event);

        if let Some(now) = self.window.newest_ts() {
            self.window.evict_before(now - self.window_len);
            self.sweep(now);
        }
    }

    /// Heartbeat tick: evict, re-run rules, persist open-episode extensions.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.window.evict_before(now - self.window_len);
        if !self.window.is_empty() {
            self.sweep(now);
        } else {
            self.close_expired(now);
        }

        for open in self.open.values_mut() {
            if open.dirty {
                match self
                    .db
                    .update_aggregated_event(open.id, open.end_ts, &open.description, &open.details)
                {
                    Ok(()) => open.dirty = false,
                    Err(e) => {
                        // Stays dirty; retried on the next heartbeat
                        tracing::warn!(error = %e, id = open.id, "Failed to persist episode extension");
                    }
                }
            }
        }
    }

    /// Close and persist every open episode (shutdown path).
    pub fn flush(&mut self) {
        let kinds: Vec<AggregateKind> = self.open.keys().copied().collect();
        for kind in kinds {
            if let Some(open) = self.open.remove(&kind) {
                self.persist_close(kind, open);
            }
        }
    }

    /// True when an identical (pwd, command) sits within the dedup tolerance
    fn is_duplicate(&self, cmd: &CommandEvent) -> bool {
        for existing in self.window.commands.iter().rev() {
            if existing.ts < cmd.ts - self.dedup_tolerance {
                break;
            }
            if (cmd.ts - existing.ts).abs() <= self.dedup_tolerance
                && existing.pwd == cmd.pwd
                && existing.command == cmd.command
            {
                return true;
            }
        }
        false
    }

    /// Persist the raw record. Raw telemetry is best-effort: a failed write
    /// is dropped, never retried, never user-blocking.
    fn persist_raw(&self, event: &ObserverEvent) {
        let result = match event {
            ObserverEvent::Command(e) => self.db.insert_command(e),
            ObserverEvent::Process(e) => self.db.insert_process_sample(e),
            ObserverEvent::Git(e) => self.db.insert_git_context(e),
            ObserverEvent::File(e) => self.db.insert_file_event(e),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, kind = %event.kind(), "Raw write failed, record dropped");
        }
    }

    /// Maintain the discovered-directory table from observed activity
    fn observe_dirs(&self, event: &ObserverEvent) {
        let result = match event {
            ObserverEvent::Command(e) if e.pwd != "/" && !e.pwd.is_empty() => {
                self.db.touch_discovered_dir(&e.pwd, false, e.ts)
            }
            ObserverEvent::Git(e) => self.db.touch_discovered_dir(&e.repo_path, true, e.ts),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to record directory observation");
        }
    }

    /// One correlation tick at the given time.
    fn sweep(&mut self, now: DateTime<Utc>) {
        self.close_expired(now);

        let mut candidates = Vec::new();
        for rule in &self.rules {
            match rule.evaluate(&self.window) {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => {
                    // This rule's tick is discarded; the others still run.
                    tracing::warn!(error = %e, kind = %rule.kind().as_str(), "Correlation rule failed");
                }
            }
        }

        // Overlapping candidates of different kinds are independent views;
        // all of them are kept.
        for candidate in candidates {
            self.reconcile(candidate);
        }

        for request in self.detector.scan(&self.window, now) {
            if let Err(e) = self.intervention_tx.try_send(request) {
                tracing::warn!(error = %e, "Intervention queue full, dropping trigger");
            }
        }
    }

    /// Close open episodes that can no longer be extended.
    fn close_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<AggregateKind> = self
            .open
            .iter()
            .filter(|(_, open)| open.end_ts + self.merge_gap < now)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in expired {
            if let Some(open) = self.open.remove(&kind) {
                self.persist_close(kind, open);
            }
        }
    }

    /// Merge a candidate into the episode bookkeeping: extend a contiguous
    /// open episode of the same kind, otherwise close it and open a new one.
    fn reconcile(&mut self, candidate: Candidate) {
        if let Some(open) = self.open.get_mut(&candidate.kind) {
            if candidate.start_ts <= open.end_ts + self.merge_gap {
                if candidate.end_ts > open.end_ts {
                    open.end_ts = candidate.end_ts;
                    open.description = candidate.description;
                    open.details = candidate.details;
                    open.dirty = true;
                }
                return;
            }
            // Not contiguous: close the current episode first.
            let kind = candidate.kind;
            if let Some(open) = self.open.remove(&kind) {
                self.persist_close(kind, open);
            }
        }

        // Same-kind intervals never overlap: clamp the new start past the
        // previous episode's end (the window may still hold its events).
        let start_ts = match self.last_closed_end.get(&candidate.kind) {
            Some(prev_end) if *prev_end > candidate.start_ts => *prev_end,
            _ => candidate.start_ts,
        };
        let end_ts = candidate.end_ts.max(start_ts);

        // The episode row is inserted at open time so a crash loses at most
        // one heartbeat of extension, never the episode itself.
        match self.db.insert_aggregated_event(
            candidate.kind,
            &candidate.description,
            start_ts,
            end_ts,
            &candidate.details,
        ) {
            Ok(id) => {
                self.open.insert(
                    candidate.kind,
                    OpenEvent {
                        id,
                        end_ts,
                        description: candidate.description,
                        details: candidate.details,
                        dirty: false,
                    },
                );
            }
            Err(e) => {
                // Derived write failed; the rule will propose again next tick.
                tracing::warn!(error = %e, kind = %candidate.kind.as_str(), "Failed to open episode");
            }
        }
    }

    fn persist_close(&mut self, kind: AggregateKind, open: OpenEvent) {
        if let Err(e) =
            self.db
                .update_aggregated_event(open.id, open.end_ts, &open.description, &open.details)
        {
            // The row exists with its last persisted end; acceptable loss.
            tracing::warn!(error = %e, id = open.id, "Failed to persist episode close");
        }
        let entry = self.last_closed_end.entry(kind).or_insert(open.end_ts);
        if open.end_ts > *entry {
            *entry = open.end_ts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnomalyConfig, CorrelatorConfig};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn command_at(secs: i64, command: &str, exit_code: i32) -> ObserverEvent {
        ObserverEvent::Command(CommandEvent {
            command: command.to_string(),
            sanitized_command: command.to_string(),
            pwd: "/home/dev/project".to_string(),
            sanitized_pwd: "/home/dev/project".to_string(),
            ts: t(secs),
            duration: 0.1,
            exit_code,
        })
    }

    fn correlator(db: Arc<Database>) -> (Correlator, mpsc::Receiver<InterventionRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let c = Correlator::new(
            db,
            &CorrelatorConfig::default(),
            &AnomalyConfig::default(),
            tx,
        );
        (c, rx)
    }

    fn test_db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_window_insert_sorts_out_of_order_arrivals() {
        let mut window = WindowState::new();
        for secs in [5, 2, 9, 2, 7] {
            if let ObserverEvent::Command(c) = command_at(secs, "ls", 0) {
                insert_by_ts(&mut window.commands, c, |x| x.ts);
            }
        }
        let times: Vec<i64> = window
            .commands
            .iter()
            .map(|c| c.ts.timestamp() - 1_700_000_000)
            .collect();
        assert_eq!(times, vec![2, 2, 5, 7, 9]);
    }

    #[test]
    fn test_window_eviction() {
        let mut window = WindowState::new();
        window.insert(command_at(0, "old", 0));
        window.insert(command_at(700, "new", 0));
        window.evict_before(t(700) - Duration::seconds(600));
        assert_eq!(window.commands.len(), 1);
        assert_eq!(window.commands[0].command, "new");
    }

    #[test]
    fn test_duplicate_commands_deduplicated() {
        let db = test_db();
        let (mut c, _rx) = correlator(db.clone());

        c.ingest(command_at(10, "make test", 0));
        // Same (pwd, command) inside the sub-second tolerance
        if let ObserverEvent::Command(mut dup) = command_at(10, "make test", 0) {
            dup.ts = t(10) + Duration::milliseconds(300);
            c.ingest(ObserverEvent::Command(dup));
        }

        let stored = db.commands_in_range(t(0), t(60), 50).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(c.window.commands.len(), 1);
    }

    #[test]
    fn test_distinct_commands_not_deduplicated() {
        let db = test_db();
        let (mut c, _rx) = correlator(db.clone());

        c.ingest(command_at(10, "make test", 0));
        c.ingest(command_at(10, "make build", 0));
        // Same command, outside tolerance
        c.ingest(command_at(12, "make test", 0));

        let stored = db.commands_in_range(t(0), t(60), 50).unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[test]
    fn test_error_loop_episode_opens_and_extends() {
        let db = test_db();
        let (mut c, _rx) = correlator(db.clone());

        for i in 0..3 {
            c.ingest(command_at(i * 5, "cargo build", 101));
        }
        let events = db.aggregated_events_by_kind(AggregateKind::ErrorLoop).unwrap();
        assert_eq!(events.len(), 1);
        let first_end = events[0].end_ts;

        // A fourth contiguous failure extends the same episode in memory;
        // the persisted end catches up on the heartbeat.
        c.ingest(command_at(20, "cargo build", 101));
        c.heartbeat(t(21));

        let events = db.aggregated_events_by_kind(AggregateKind::ErrorLoop).unwrap();
        assert_eq!(events.len(), 1, "contiguous failures extend, not reopen");
        assert!(events[0].end_ts > first_end);
    }

    #[test]
    fn test_same_kind_intervals_never_overlap() {
        let db = test_db();
        let (mut c, _rx) = correlator(db.clone());

        // First episode
        for i in 0..3 {
            c.ingest(command_at(i * 5, "cargo build", 101));
        }
        // Far beyond the merge gap: episode closes, a new one opens
        for i in 0..3 {
            c.ingest(command_at(400 + i * 5, "cargo build", 101));
        }
        c.flush();

        let events = db.aggregated_events_by_kind(AggregateKind::ErrorLoop).unwrap();
        assert_eq!(events.len(), 2);
        for pair in events.windows(2) {
            assert!(
                pair[0].end_ts <= pair[1].start_ts || pair[1].end_ts <= pair[0].start_ts,
                "intervals {:?} and {:?} overlap",
                (pair[0].start_ts, pair[0].end_ts),
                (pair[1].start_ts, pair[1].end_ts)
            );
        }
    }

    #[test]
    fn test_replay_is_idempotent() {
        let stream: Vec<i64> = vec![0, 5, 10, 15, 120, 125, 130];

        let run = || {
            let db = test_db();
            let (mut c, _rx) = correlator(db.clone());
            for secs in &stream {
                c.ingest(command_at(*secs, "pytest tests/", 1));
            }
            c.flush();
            db.aggregated_events_by_kind(AggregateKind::ErrorLoop)
                .unwrap()
                .into_iter()
                .map(|e| (e.start_ts, e.end_ts, e.description))
                .collect::<Vec<_>>()
        };

        let first = run();
        let second = run();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_episode_flushed_on_shutdown() {
        let db = test_db();
        let (mut c, _rx) = correlator(db.clone());

        for i in 0..3 {
            c.ingest(command_at(i * 5, "npm run lint", 2));
        }
        c.flush();

        let events = db.aggregated_events_by_kind(AggregateKind::ErrorLoop).unwrap();
        assert_eq!(events.len(), 1);
        // end covers the last failure
        assert!(events[0].end_ts > events[0].start_ts);
    }

    #[test]
    fn test_dirs_discovered_from_commands_and_git() {
        let db = test_db();
        let (mut c, _rx) = correlator(db.clone());

        c.ingest(command_at(0, "ls", 0));
        c.ingest(ObserverEvent::Git(GitContext {
            ts: t(1),
            repo_path: "/home/dev/project".to_string(),
            branch: "feat/x".to_string(),
            branch_kind: BranchKind::Feat,
        }));

        let dir = db
            .get_discovered_dir("/home/dev/project")
            .unwrap()
            .unwrap();
        assert_eq!(dir.access_count, 2);
        assert!(dir.is_git_repo);
    }
}
