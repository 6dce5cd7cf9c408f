//! Wire records accepted from producers
//!
//! One JSON object per line, self-describing via the `kind` tag, timestamped
//! by the producer's clock (fractional epoch seconds). The shape differs per
//! collector; unknown extra fields are ignored, missing required fields make
//! the record malformed.

use crate::sanitize::Sanitizer;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One producer record as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireRecord {
    /// Shell hook record
    Command {
        command: String,
        pwd: String,
        ts: f64,
        duration: f64,
        exit_code: i32,
    },
    /// Process sampler record
    Process {
        ts: f64,
        name: String,
        pid: i32,
        cpu_percent: f64,
        memory_mb: f64,
    },
    /// Git context prober record
    Git {
        ts: f64,
        repo_path: String,
        branch: String,
    },
    /// File watcher record
    File {
        ts: f64,
        path: String,
        event: FileEventKind,
    },
}

/// Convert fractional epoch seconds into a timestamp.
///
/// Returns None for non-finite, negative, or out-of-range values.
fn ts_from_epoch(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
}

impl WireRecord {
    /// Validate and sanitize into the internal event type.
    ///
    /// Returns the normalized event and how many redactions were applied,
    /// or None when the record is malformed (bad timestamp).
    pub fn normalize(self, sanitizer: &Sanitizer) -> Option<(ObserverEvent, usize)> {
        match self {
            WireRecord::Command {
                command,
                pwd,
                ts,
                duration,
                exit_code,
            } => {
                let ts = ts_from_epoch(ts)?;
                let (sanitized_command, n1) = sanitizer.sanitize(&command);
                let (sanitized_pwd, n2) = sanitizer.sanitize(&pwd);
                Some((
                    ObserverEvent::Command(CommandEvent {
                        command,
                        sanitized_command,
                        pwd,
                        sanitized_pwd,
                        ts,
                        duration,
                        exit_code,
                    }),
                    n1 + n2,
                ))
            }
            WireRecord::Process {
                ts,
                name,
                pid,
                cpu_percent,
                memory_mb,
            } => {
                let ts = ts_from_epoch(ts)?;
                Some((
                    ObserverEvent::Process(ProcessSample {
                        ts,
                        name,
                        pid,
                        cpu_percent,
                        memory_mb,
                    }),
                    0,
                ))
            }
            WireRecord::Git {
                ts,
                repo_path,
                branch,
            } => {
                let ts = ts_from_epoch(ts)?;
                let branch_kind = BranchKind::classify(&branch);
                Some((
                    ObserverEvent::Git(GitContext {
                        ts,
                        repo_path,
                        branch,
                        branch_kind,
                    }),
                    0,
                ))
            }
            WireRecord::File { ts, path, event } => {
                let ts = ts_from_epoch(ts)?;
                let (sanitized_path, n) = sanitizer.sanitize(&path);
                Some((
                    ObserverEvent::File(FileEvent {
                        ts,
                        path,
                        sanitized_path,
                        kind: event,
                    }),
                    n,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::from_specs(&[]).unwrap()
    }

    #[test]
    fn test_parse_command_record() {
        let line = r#"{"kind":"command","command":"ls -la","pwd":"/tmp","ts":1700000000.25,"duration":0.1,"exit_code":0}"#;
        let record: WireRecord = serde_json::from_str(line).unwrap();
        let (event, redactions) = record.normalize(&sanitizer()).unwrap();

        match event {
            ObserverEvent::Command(c) => {
                assert_eq!(c.command, "ls -la");
                assert_eq!(c.ts.timestamp(), 1_700_000_000);
                assert_eq!(c.ts.timestamp_subsec_millis(), 250);
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert_eq!(redactions, 0);
    }

    #[test]
    fn test_command_is_sanitized_at_the_boundary() {
        let line = r#"{"kind":"command","command":"export TOKEN=abc123xyz","pwd":"/tmp","ts":1700000000,"duration":0.1,"exit_code":0}"#;
        let record: WireRecord = serde_json::from_str(line).unwrap();
        let (event, redactions) = record.normalize(&sanitizer()).unwrap();

        match event {
            ObserverEvent::Command(c) => {
                assert!(c.sanitized_command.contains("[REDACTED:api_key]"));
                assert!(!c.sanitized_command.contains("abc123xyz"));
                // Raw text survives alongside the sanitized copy
                assert!(c.command.contains("abc123xyz"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert_eq!(redactions, 1);
    }

    #[test]
    fn test_git_branch_classified_on_normalize() {
        let line = r#"{"kind":"git","ts":1700000000,"repo_path":"/home/dev/app","branch":"feat/login"}"#;
        let record: WireRecord = serde_json::from_str(line).unwrap();
        let (event, _) = record.normalize(&sanitizer()).unwrap();

        match event {
            ObserverEvent::Git(g) => assert_eq!(g.branch_kind, BranchKind::Feat),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_extra_fields_tolerated() {
        let line = r#"{"kind":"file","ts":1700000000,"path":"/tmp/a.rs","event":"modified","source":"watcher-v2"}"#;
        assert!(serde_json::from_str::<WireRecord>(line).is_ok());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let line = r#"{"kind":"command","command":"ls","ts":1700000000}"#;
        assert!(serde_json::from_str::<WireRecord>(line).is_err());
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let record = WireRecord::File {
            ts: -5.0,
            path: "/tmp/x".into(),
            event: FileEventKind::Created,
        };
        assert!(record.normalize(&sanitizer()).is_none());
    }
}
