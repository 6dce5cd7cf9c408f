//! Integration tests for the worklens pipeline
//!
//! These drive the real ingestion socket and the full task wiring: producer
//! lines go in over the Unix socket, sanitized rows and derived episodes
//! come out of the database.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use worklens_core::classify::{
    Classifier, InferenceClient, InferenceRequest, InferenceResponse, TaskMode,
};
use worklens_core::config::{Config, InferenceConfig};
use worklens_core::correlate::Correlator;
use worklens_core::{AggregateKind, AnomalyKind, Database, Pipeline, WorkStatus};

/// Scripted inference client: pops one result per call.
struct ScriptedClient {
    script: Mutex<Vec<worklens_core::Result<InferenceResponse>>>,
    calls: AtomicUsize,
    last_mode: Mutex<Option<TaskMode>>,
}

impl ScriptedClient {
    fn new(script: Vec<worklens_core::Result<InferenceResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            last_mode: Mutex::new(None),
        })
    }

    fn always(status: WorkStatus, summary: &str, confidence: f64) -> Arc<Self> {
        // An empty script errors; seed generously instead.
        let response = InferenceResponse {
            status,
            summary: summary.to_string(),
            confidence,
            tools_used: vec![],
        };
        Self::new(std::iter::repeat_with(|| Ok(response.clone())).take(64).collect())
    }
}

impl InferenceClient for ScriptedClient {
    fn infer(&self, request: &InferenceRequest) -> worklens_core::Result<InferenceResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_mode.lock().unwrap() = Some(request.mode);
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(worklens_core::Error::Inference("script exhausted".into()));
        }
        script.remove(0)
    }
}

fn test_config(dir: &TempDir) -> Config {
    let toml = format!(
        r#"
[ingest]
socket_path = "{}"

[inference]
endpoint = "http://localhost:1/unused"
retry_base_ms = 1
"#,
        dir.path().join("test.sock").display()
    );
    toml::from_str(&toml).unwrap()
}

fn open_db(dir: &TempDir) -> Arc<Database> {
    let db = Database::open(&dir.path().join("test.db")).unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn send_lines(socket: &std::path::Path, lines: &[String]) {
    let mut stream = std::os::unix::net::UnixStream::connect(socket).unwrap();
    for line in lines {
        writeln!(stream, "{}", line).unwrap();
    }
    stream.flush().unwrap();
}

fn command_line(ts: f64, command: &str, exit_code: i32) -> String {
    format!(
        r#"{{"kind":"command","command":"{}","pwd":"/home/dev/app","ts":{},"duration":0.1,"exit_code":{}}}"#,
        command, ts, exit_code
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}

// ============================================
// Socket-to-storage flow
// ============================================

#[tokio::test(flavor = "multi_thread")]
async fn test_producer_lines_reach_storage_sanitized() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let db = open_db(&dir);
    let client = ScriptedClient::always(WorkStatus::Coding, "working", 0.9);

    let pipeline = Pipeline::start(&config, db.clone(), client).unwrap();
    // Give the listener a beat to bind the socket
    tokio::time::sleep(Duration::from_millis(100)).await;

    let now = Utc::now().timestamp() as f64;
    send_lines(
        &config.socket_path(),
        &[
            command_line(now, "export TOKEN=abc123xyz", 0),
            "this is not json".to_string(),
            command_line(now + 1.0, "cargo build", 0),
        ],
    );
    settle().await;

    let commands = db
        .commands_in_range(
            Utc::now() - chrono::Duration::minutes(5),
            Utc::now() + chrono::Duration::minutes(5),
            50,
        )
        .unwrap();
    assert_eq!(commands.len(), 2);

    // Sanitized counterparts are always present, secrets redacted
    let token_cmd = commands
        .iter()
        .find(|c| c.command.contains("TOKEN"))
        .unwrap();
    assert!(token_cmd.sanitized_command.contains("[REDACTED:api_key]"));
    assert!(!token_cmd.sanitized_command.contains("abc123xyz"));

    // The malformed line was counted, and did not kill the connection
    let stats = pipeline.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.malformed, 1);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_flushes_open_episodes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let db = open_db(&dir);
    let client = ScriptedClient::always(WorkStatus::Debugging, "looping", 0.8);

    let pipeline = Pipeline::start(&config, db.clone(), client).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let now = Utc::now().timestamp() as f64;
    send_lines(
        &config.socket_path(),
        &[
            command_line(now, "cat missing.py", 1),
            command_line(now + 4.0, "cat missing.py", 1),
            command_line(now + 9.0, "cat missing.py", 1),
        ],
    );
    settle().await;

    // Shutdown must persist the still-open episode
    pipeline.shutdown().await;

    let episodes = db.aggregated_events_by_kind(AggregateKind::ErrorLoop).unwrap();
    assert_eq!(episodes.len(), 1);
    assert!(episodes[0].end_ts > episodes[0].start_ts);
    assert_eq!(episodes[0].details["count"], 3);
}

// ============================================
// Anomaly-to-intervention flow
// ============================================

#[tokio::test]
async fn test_error_loop_fires_one_intervention() {
    let db = {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    };

    let config = Config::default();
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let mut correlator = Correlator::new(db.clone(), &config.correlator, &config.anomaly, tx);

    let base = Utc::now();
    for offset in [0, 4, 9] {
        correlator.ingest(worklens_core::ObserverEvent::Command(
            worklens_core::CommandEvent {
                command: "cat missing.py".into(),
                sanitized_command: "cat missing.py".into(),
                pwd: "/home/dev/app".into(),
                sanitized_pwd: "/home/dev/app".into(),
                ts: base + chrono::Duration::seconds(offset),
                duration: 0.1,
                exit_code: 1,
            },
        ));
    }
    // A fourth identical failure within the cooldown
    correlator.ingest(worklens_core::ObserverEvent::Command(
        worklens_core::CommandEvent {
            command: "cat missing.py".into(),
            sanitized_command: "cat missing.py".into(),
            pwd: "/home/dev/app".into(),
            sanitized_pwd: "/home/dev/app".into(),
            ts: base + chrono::Duration::seconds(15),
            duration: 0.1,
            exit_code: 1,
        },
    ));

    // Exactly one trigger made it through the cooldown
    let request = rx.try_recv().unwrap();
    assert_eq!(request.anomaly, AnomalyKind::ErrorLoop);
    assert!(rx.try_recv().is_err());

    // Feed the trigger to the classifier's intervention path
    let inference = InferenceConfig {
        endpoint: Some("http://localhost:1/unused".into()),
        retry_base_ms: 1,
        ..Default::default()
    };
    let client = ScriptedClient::always(WorkStatus::Debugging, "stuck on a missing file", 0.85);
    let mut classifier = Classifier::new(db.clone(), inference, client.clone());
    let (_shutdown_tx, mut shutdown) = tokio::sync::watch::channel(false);
    classifier.classify_intervention(request, &mut shutdown).await;

    assert_eq!(*client.last_mode.lock().unwrap(), Some(TaskMode::Intervention));
    let interventions = db.list_interventions().unwrap();
    assert_eq!(interventions.len(), 1);
    assert_eq!(interventions[0].anomaly, AnomalyKind::ErrorLoop);
    assert_eq!(interventions[0].analysis["status"], "debugging");
    assert_eq!(interventions[0].trigger_context["count"], 3);
}

// ============================================
// Degraded classification
// ============================================

#[tokio::test]
async fn test_retry_then_success_and_total_failure() {
    let db = {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    };
    db.insert_command(&worklens_core::CommandEvent {
        command: "cargo test".into(),
        sanitized_command: "cargo test".into(),
        pwd: "/home/dev/app".into(),
        sanitized_pwd: "/home/dev/app".into(),
        ts: Utc::now(),
        duration: 1.0,
        exit_code: 0,
    })
    .unwrap();

    let inference = InferenceConfig {
        endpoint: Some("http://localhost:1/unused".into()),
        retry_base_ms: 1,
        ..Default::default()
    };

    // Two timeouts, then success: the final analysis is the real result.
    let client = ScriptedClient::new(vec![
        Err(worklens_core::Error::Inference("timed out".into())),
        Err(worklens_core::Error::Inference("timed out".into())),
        Ok(InferenceResponse {
            status: WorkStatus::Coding,
            summary: "iterating on tests".into(),
            confidence: 0.9,
            tools_used: vec![],
        }),
    ]);
    let mut classifier = Classifier::new(db.clone(), inference.clone(), client);
    let (_tx, mut shutdown) = tokio::sync::watch::channel(false);
    classifier.classify_periodic(&mut shutdown).await;

    let latest = db.latest_analysis().unwrap().unwrap();
    assert_eq!(latest.status, WorkStatus::Coding);
    assert_eq!(latest.summary, "iterating on tests");

    // Every attempt fails: the analysis degrades to unknown, confidence 0.
    let client = ScriptedClient::new(vec![]);
    let mut classifier = Classifier::new(db.clone(), inference, client);
    classifier.classify_periodic(&mut shutdown).await;

    let latest = db.latest_analysis().unwrap().unwrap();
    assert_eq!(latest.status, WorkStatus::Unknown);
    assert_eq!(latest.confidence, 0.0);
}
