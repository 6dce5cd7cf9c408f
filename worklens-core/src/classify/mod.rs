//! Intent classification
//!
//! Two invocation modes share one task: a periodic cadence producing an
//! [`Analysis`](crate::types::Analysis) row, and anomaly-triggered
//! interventions producing an [`Intervention`](crate::types::Intervention)
//! row. Both assemble their context purely from sanitized storage columns;
//! the classifier never touches raw unredacted text.
//!
//! The external call is an unreliable, latent, rate-limited dependency.
//! Retry/backoff is explicit control flow here — an attempt counter and a
//! doubling delay — not something hidden in the client. After the attempt
//! ceiling the classifier degrades to an `unknown` result rather than
//! leaving a gap, so callers can always read a most-recent analysis.
//!
//! All classification work is serialized through this one task: at most one
//! external call is in flight at any time.

mod client;

pub use client::{HttpInferenceClient, InferenceClient};

use crate::config::InferenceConfig;
use crate::correlate::InterventionRequest;
use crate::db::Database;
use crate::error::Result;
use crate::types::{Analysis, WorkStatus};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Why the classifier is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Periodic,
    Intervention,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Periodic => "periodic",
            TaskMode::Intervention => "intervention",
        }
    }
}

/// Sanitized view of recent activity, assembled from storage
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextSnapshot {
    pub commands: Vec<SnapshotCommand>,
    pub git_contexts: Vec<SnapshotGit>,
    pub aggregated_events: Vec<SnapshotAggregate>,
    pub processes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCommand {
    pub command: String,
    pub exit_code: i32,
    pub ts: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotGit {
    pub repo_path: String,
    pub branch: String,
    pub branch_kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotAggregate {
    pub kind: String,
    pub description: String,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.git_contexts.is_empty()
            && self.aggregated_events.is_empty()
            && self.processes.is_empty()
    }
}

/// One request to the external service
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub mode: TaskMode,
    pub snapshot: ContextSnapshot,
    /// Trigger context, present in intervention mode
    pub anomaly: Option<serde_json::Value>,
}

/// Parsed service response
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub status: WorkStatus,
    pub summary: String,
    pub confidence: f64,
    pub tools_used: Vec<String>,
}

/// Outcome of a call-with-retry cycle
enum CallOutcome {
    Ok(InferenceResponse),
    /// All attempts failed; degrade, do not gap
    Exhausted,
    /// Shutdown arrived mid-call; discard, never partially write
    Aborted,
}

/// The classification task
pub struct Classifier {
    db: Arc<Database>,
    cfg: InferenceConfig,
    client: Arc<dyn InferenceClient>,
    /// Last successful classification, kept for cheap reads
    last_good: Option<Analysis>,
    /// How far back the snapshot looks
    lookback: ChronoDuration,
}

/// Row caps for the snapshot queries
const SNAPSHOT_COMMAND_LIMIT: usize = 50;
const SNAPSHOT_GIT_LIMIT: usize = 10;
const SNAPSHOT_AGGREGATE_LIMIT: usize = 10;

/// Retry delays stop doubling here
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

impl Classifier {
    pub fn new(db: Arc<Database>, cfg: InferenceConfig, client: Arc<dyn InferenceClient>) -> Self {
        let lookback = ChronoDuration::seconds(cfg.cadence_secs as i64);
        Self {
            db,
            cfg,
            client,
            last_good: None,
            lookback,
        }
    }

    /// The last successful classification this run, if any
    pub fn last_good(&self) -> Option<&Analysis> {
        self.last_good.as_ref()
    }

    /// Serve the cadence and the intervention queue until shutdown.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<InterventionRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut cadence = tokio::time::interval(Duration::from_secs(self.cfg.cadence_secs));
        cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(cadence_secs = self.cfg.cadence_secs, "Classifier started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = cadence.tick() => self.classify_periodic(&mut shutdown).await,
                request = rx.recv() => match request {
                    Some(request) => self.classify_intervention(request, &mut shutdown).await,
                    None => break,
                },
            }
        }

        tracing::info!("Classifier stopped");
    }

    /// Scheduled classification producing an Analysis row.
    pub async fn classify_periodic(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let snapshot = match self.snapshot() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to assemble context snapshot");
                return;
            }
        };

        // Nothing happened: that is an answer, not a service call.
        if snapshot.is_empty() {
            self.record_analysis(WorkStatus::Idle, "No recent activity detected", 1.0);
            return;
        }

        let request = InferenceRequest {
            mode: TaskMode::Periodic,
            snapshot,
            anomaly: None,
        };

        match self.call_with_retry(request, shutdown).await {
            CallOutcome::Ok(response) => {
                self.record_analysis(response.status, &response.summary, response.confidence);
            }
            CallOutcome::Exhausted => {
                self.record_analysis(
                    WorkStatus::Unknown,
                    "Classification unavailable: inference service unreachable",
                    0.0,
                );
            }
            CallOutcome::Aborted => {}
        }
    }

    /// Anomaly-triggered classification producing an Intervention row.
    pub async fn classify_intervention(
        &mut self,
        request: InterventionRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let snapshot = match self.snapshot() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to assemble context snapshot");
                return;
            }
        };

        let call = InferenceRequest {
            mode: TaskMode::Intervention,
            snapshot,
            anomaly: Some(request.trigger_context.clone()),
        };

        let (analysis, tools_used, confidence) = match self.call_with_retry(call, shutdown).await {
            CallOutcome::Ok(response) => (
                json!({
                    "status": response.status.as_str(),
                    "summary": response.summary,
                    "confidence": response.confidence,
                }),
                response.tools_used,
                response.confidence,
            ),
            CallOutcome::Exhausted => (
                json!({
                    "status": WorkStatus::Unknown.as_str(),
                    "summary": "Inference service unreachable",
                    "confidence": 0.0,
                }),
                Vec::new(),
                0.0,
            ),
            CallOutcome::Aborted => return,
        };

        // The anomaly fired, so the audit row is written even when the
        // analysis degraded.
        if let Err(e) = self.db.insert_intervention(
            Utc::now(),
            request.anomaly,
            &request.trigger_context,
            &analysis,
            &tools_used,
            confidence,
        ) {
            tracing::warn!(error = %e, "Failed to record intervention");
        } else {
            tracing::info!(
                anomaly = %request.anomaly.as_str(),
                confidence,
                "Intervention recorded"
            );
        }
    }

    /// Bounded-retry call. The retry state is right here: the attempt
    /// counter and the current delay, nothing implicit.
    async fn call_with_retry(
        &self,
        request: InferenceRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CallOutcome {
        let mut attempt: u32 = 0;
        let mut delay = Duration::from_millis(self.cfg.retry_base_ms);

        loop {
            attempt += 1;

            let client = self.client.clone();
            let call_request = request.clone();
            // The external call may block for the full timeout; keep it off
            // the async executor.
            let call = tokio::task::spawn_blocking(move || client.infer(&call_request));

            tokio::select! {
                joined = call => match joined {
                    Ok(Ok(response)) => return CallOutcome::Ok(response),
                    Ok(Err(e)) => {
                        tracing::warn!(attempt, error = %e, "Inference attempt failed");
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Inference task panicked");
                    }
                },
                _ = shutdown.changed() => return CallOutcome::Aborted,
            }

            if attempt > self.cfg.max_retries {
                return CallOutcome::Exhausted;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return CallOutcome::Aborted,
            }
            delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
        }
    }

    /// Assemble the snapshot from sanitized storage columns only.
    pub fn snapshot(&self) -> Result<ContextSnapshot> {
        let end = Utc::now();
        let start = end - self.lookback;

        let commands = self
            .db
            .commands_in_range(start, end, SNAPSHOT_COMMAND_LIMIT)?
            .into_iter()
            .map(|c| SnapshotCommand {
                command: c.sanitized_command,
                exit_code: c.exit_code,
                ts: c.ts.to_rfc3339(),
                duration: c.duration,
            })
            .collect();

        let git_contexts = self
            .db
            .git_contexts_in_range(start, end, SNAPSHOT_GIT_LIMIT)?
            .into_iter()
            .map(|g| SnapshotGit {
                repo_path: g.repo_path,
                branch: g.branch,
                branch_kind: g.branch_kind.as_str().to_string(),
            })
            .collect();

        let aggregated_events = self
            .db
            .aggregated_events_in_range(start, end, SNAPSHOT_AGGREGATE_LIMIT)?
            .into_iter()
            .map(|e| SnapshotAggregate {
                kind: e.kind.as_str().to_string(),
                description: e.description,
            })
            .collect();

        let processes = self.db.process_names_in_range(start, end)?;

        Ok(ContextSnapshot {
            commands,
            git_contexts,
            aggregated_events,
            processes,
        })
    }

    fn record_analysis(&mut self, status: WorkStatus, summary: &str, confidence: f64) {
        let ts = Utc::now();
        match self.db.insert_analysis(ts, status, summary, confidence) {
            Ok(id) => {
                tracing::info!(status = %status.as_str(), confidence, "Analysis recorded");
                if status != WorkStatus::Unknown {
                    self.last_good = Some(Analysis {
                        id,
                        ts,
                        status,
                        summary: summary.to_string(),
                        confidence,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record analysis");
            }
        }
    }
}
