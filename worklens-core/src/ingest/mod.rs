//! Ingestion server for producer records
//!
//! A long-lived Unix-socket listener accepting newline-delimited JSON from
//! independent producers (shell hook, process sampler, file watcher, git
//! prober). Records are validated and sanitized here, at the trust boundary,
//! and flow into a bounded queue consumed by the correlator.
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌──────────────┐
//! │  producers   │ ──► │ IngestServer  │ ──► │  Correlator  │
//! │ (NDJSON/sock)│     │ parse+sanitize│     │ (bounded rx) │
//! └──────────────┘     └───────────────┘     └──────────────┘
//! ```
//!
//! Producers are interactive shells and must never stall on telemetry, so
//! nothing in this module blocks them: malformed lines are dropped and
//! counted; a connection that outruns the pipeline loses its oldest unread
//! frames; a full correlator queue rejects new records. Every drop is
//! visible in [`IngestStats`].

mod wire;

pub use wire::WireRecord;

use crate::config::IngestConfig;
use crate::error::Result;
use crate::sanitize::Sanitizer;
use crate::types::ObserverEvent;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

/// Drop and throughput counters, shared across connection tasks
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    malformed: AtomicU64,
    backlog_dropped: AtomicU64,
    queue_full: AtomicU64,
    redactions: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            backlog_dropped: self.backlog_dropped.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            redactions: self.redactions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`IngestStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Records handed to the correlator queue
    pub accepted: u64,
    /// Unparseable or invalid records dropped
    pub malformed: u64,
    /// Oldest unread frames dropped from a too-fast connection
    pub backlog_dropped: u64,
    /// New records rejected by a full correlator queue
    pub queue_full: u64,
    /// Total redactions applied at the boundary
    pub redactions: u64,
}

/// Per-connection frame processing.
///
/// Owns the connection's unread backlog. Kept separate from the socket
/// plumbing so the drop policies are testable without a socket.
struct FrameHandler {
    sanitizer: Arc<Sanitizer>,
    stats: Arc<IngestStats>,
    tx: mpsc::Sender<ObserverEvent>,
    pending: VecDeque<ObserverEvent>,
    backlog: usize,
    max_frame_bytes: usize,
}

impl FrameHandler {
    fn new(
        sanitizer: Arc<Sanitizer>,
        stats: Arc<IngestStats>,
        tx: mpsc::Sender<ObserverEvent>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            sanitizer,
            stats,
            tx,
            pending: VecDeque::new(),
            backlog: config.connection_backlog,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// Process one line off the wire. Never fails; bad input is counted.
    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if line.len() > self.max_frame_bytes {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let record: WireRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed record");
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match record.normalize(&self.sanitizer) {
            Some((event, redactions)) => {
                if redactions > 0 {
                    self.stats
                        .redactions
                        .fetch_add(redactions as u64, Ordering::Relaxed);
                }
                self.enqueue(event);
            }
            None => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Hand an event to the correlator queue, spilling into the bounded
    /// per-connection backlog when the queue is full.
    fn enqueue(&mut self, event: ObserverEvent) {
        self.flush();

        if self.pending.is_empty() {
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                    self.pending.push_back(event);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        } else {
            self.pending.push_back(event);
        }

        while self.pending.len() > self.backlog {
            self.pending.pop_front();
            self.stats.backlog_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drain as much backlog as the queue will take, preserving order.
    fn flush(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.pending.push_front(event);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }
}

/// The producer-facing listener
pub struct IngestServer {
    socket_path: PathBuf,
    config: IngestConfig,
    sanitizer: Arc<Sanitizer>,
    tx: mpsc::Sender<ObserverEvent>,
    stats: Arc<IngestStats>,
}

impl IngestServer {
    pub fn new(
        socket_path: PathBuf,
        config: IngestConfig,
        sanitizer: Arc<Sanitizer>,
        tx: mpsc::Sender<ObserverEvent>,
    ) -> Self {
        Self {
            socket_path,
            config,
            sanitizer,
            tx,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Shared drop counters
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Accept connections until shutdown.
    ///
    /// A stale socket file from a previous run is replaced. The socket is
    /// chmod 0600 — this channel is host-local and single-user.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(socket = %self.socket_path.display(), "Ingestion server listening");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        let handler = FrameHandler::new(
                            self.sanitizer.clone(),
                            self.stats.clone(),
                            self.tx.clone(),
                            &self.config,
                        );
                        tokio::spawn(serve_connection(stream, handler, shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("Ingestion server stopped");
        Ok(())
    }
}

/// Read lines from one producer until it disconnects or shutdown.
async fn serve_connection(
    stream: UnixStream,
    mut handler: FrameHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let reader = BufReader::new(stream);
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handler.handle_line(&line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Connection read error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    // Best-effort handoff of whatever the queue will still take
    handler.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;

    fn handler(
        queue_capacity: usize,
        backlog: usize,
    ) -> (FrameHandler, mpsc::Receiver<ObserverEvent>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let config = IngestConfig {
            connection_backlog: backlog,
            ..Default::default()
        };
        let h = FrameHandler::new(
            Arc::new(Sanitizer::from_specs(&[]).unwrap()),
            Arc::new(IngestStats::default()),
            tx,
            &config,
        );
        (h, rx)
    }

    fn command_line(ts: f64, command: &str) -> String {
        format!(
            r#"{{"kind":"command","command":"{}","pwd":"/tmp","ts":{},"duration":0.1,"exit_code":0}}"#,
            command, ts
        )
    }

    #[test]
    fn test_valid_record_accepted() {
        let (mut h, mut rx) = handler(8, 4);
        h.handle_line(&command_line(1_700_000_000.0, "ls"));

        assert_eq!(h.stats.snapshot().accepted, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_malformed_records_do_not_change_accepted_count() {
        let (mut h, mut rx) = handler(8, 4);

        h.handle_line("not json at all");
        h.handle_line(r#"{"kind":"command","command":"ls"}"#);
        h.handle_line(r#"{"kind":"teapot","ts":1}"#);
        h.handle_line(r#"{"kind":"file","ts":-1,"path":"/x","event":"created"}"#);

        let stats = h.stats.snapshot();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.malformed, 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_blank_lines_ignored() {
        let (mut h, _rx) = handler(8, 4);
        h.handle_line("");
        h.handle_line("   ");
        let stats = h.stats.snapshot();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.malformed, 0);
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let (mut h, _rx) = handler(8, 4);
        h.max_frame_bytes = 32;
        h.handle_line(&command_line(1_700_000_000.0, &"x".repeat(100)));
        assert_eq!(h.stats.snapshot().malformed, 1);
    }

    #[test]
    fn test_queue_full_counts_and_never_blocks() {
        // Queue of 1, nothing draining it
        let (mut h, _rx) = handler(1, 4);

        h.handle_line(&command_line(1.0, "a"));
        h.handle_line(&command_line(2.0, "b"));

        let stats = h.stats.snapshot();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.queue_full, 1);
    }

    #[test]
    fn test_backlog_drops_oldest_frame() {
        // Queue of 1 (filled immediately), backlog of 2
        let (mut h, mut rx) = handler(1, 2);

        h.handle_line(&command_line(1.0, "first"));
        h.handle_line(&command_line(2.0, "second"));
        h.handle_line(&command_line(3.0, "third"));
        h.handle_line(&command_line(4.0, "fourth"));

        let stats = h.stats.snapshot();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.backlog_dropped, 1);

        // "first" made it into the queue; "second" (the oldest unread frame)
        // was dropped; "third" and "fourth" are still pending.
        match rx.try_recv().unwrap() {
            ObserverEvent::Command(c) => assert_eq!(c.command, "first"),
            other => panic!("wrong variant: {:?}", other),
        }

        // Once the queue drains, pending frames flow through in order.
        h.handle_line(&command_line(5.0, "fifth"));
        match rx.try_recv().unwrap() {
            ObserverEvent::Command(c) => assert_eq!(c.command, "third"),
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
