//! Pipeline wiring and lifecycle
//!
//! One ingestion listener feeds a bounded queue consumed by one correlator
//! loop; the classifier and retention manager run as independent scheduled
//! tasks. All mutable daemon state lives inside the tasks that own it — the
//! pipeline object only holds the shutdown signal and the join handles.
//!
//! Shutdown stops accepting new ingestion, flushes open aggregated events,
//! and lets an in-flight classification either complete or be abandoned
//! with its result discarded.

use crate::classify::{Classifier, InferenceClient};
use crate::config::Config;
use crate::correlate::{Correlator, InterventionRequest};
use crate::db::Database;
use crate::error::Result;
use crate::ingest::{IngestServer, IngestStats, StatsSnapshot};
use crate::retention::RetentionManager;
use crate::sanitize::Sanitizer;
use crate::types::ObserverEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the intervention queue between detector and classifier
const INTERVENTION_QUEUE: usize = 16;

/// A running pipeline. Dropping it does not stop the tasks; call
/// [`Pipeline::shutdown`] for a clean stop.
pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<IngestStats>,
}

impl Pipeline {
    /// Validate configuration, compile the redaction rules, and spawn every
    /// task. Must be called from within a tokio runtime.
    ///
    /// Configuration problems (bad redaction rule, missing inference
    /// endpoint) are the only fatal errors; everything after this point
    /// degrades instead of crashing.
    pub fn start(
        config: &Config,
        db: Arc<Database>,
        client: Arc<dyn InferenceClient>,
    ) -> Result<Self> {
        config.inference.validate()?;
        let sanitizer = Arc::new(Sanitizer::from_specs(&config.sanitizer.rules)?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel::<ObserverEvent>(config.ingest.queue_capacity);
        let (intervention_tx, intervention_rx) =
            mpsc::channel::<InterventionRequest>(INTERVENTION_QUEUE);

        let server = IngestServer::new(
            config.socket_path(),
            config.ingest.clone(),
            sanitizer,
            event_tx,
        );
        let stats = server.stats();

        let correlator = Correlator::new(
            db.clone(),
            &config.correlator,
            &config.anomaly,
            intervention_tx,
        );
        let classifier = Classifier::new(db.clone(), config.inference.clone(), client);
        let retention = RetentionManager::new(db, config.retention.clone());

        let mut handles = Vec::new();

        let server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(server_shutdown).await {
                tracing::error!(error = %e, "Ingestion server exited with error");
            }
        }));

        let correlator_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            correlator.run(event_rx, correlator_shutdown).await;
        }));

        let classifier_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            classifier.run(intervention_rx, classifier_shutdown).await;
        }));

        handles.push(tokio::spawn(async move {
            retention.run(shutdown_rx).await;
        }));

        tracing::info!("Pipeline started");

        Ok(Self {
            shutdown_tx,
            handles,
            stats,
        })
    }

    /// Ingestion drop counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal every task and wait for them to finish.
    pub async fn shutdown(self) {
        tracing::info!("Pipeline shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Pipeline task panicked during shutdown");
            }
        }
        tracing::info!("Pipeline stopped");
    }
}
