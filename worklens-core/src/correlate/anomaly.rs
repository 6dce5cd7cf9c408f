//! Behavioral anomaly detection
//!
//! A read-only consumer of the correlator's window. When a rule fires it
//! assembles a sanitized trigger context and forwards an intervention
//! request to the classifier; the detector itself never calls the external
//! service — it only decides whether to ask.
//!
//! Each anomaly type fires at most once per cooldown window per directory,
//! so a sustained condition does not retrigger.

use super::WindowState;
use crate::config::AnomalyConfig;
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

/// Command substrings that mark build/test/run invocations
const BUILD_PATTERNS: &[&str] = &[
    "make", "gcc", "g++", "clang", "cargo build", "cargo test", "npm run", "pnpm run", "yarn",
    "pytest", "python", "java", "mvn", "go build", "go test",
];

/// A detector firing, handed to the classifier's intervention path
#[derive(Debug, Clone)]
pub struct InterventionRequest {
    pub anomaly: AnomalyKind,
    pub triggered_at: DateTime<Utc>,
    /// Sanitized snapshot of what triggered the firing
    pub trigger_context: serde_json::Value,
}

/// Detects repeating-failure and error-loop patterns in the recent window
pub struct AnomalyDetector {
    cfg: AnomalyConfig,
    last_fired: HashMap<(AnomalyKind, String), DateTime<Utc>>,
}

impl AnomalyDetector {
    pub fn new(cfg: AnomalyConfig) -> Self {
        Self {
            cfg,
            last_fired: HashMap::new(),
        }
    }

    /// Run all checks against the window. Returns the requests that survived
    /// their cooldowns.
    pub fn scan(&mut self, window: &WindowState, now: DateTime<Utc>) -> Vec<InterventionRequest> {
        let cutoff = now - Duration::seconds(self.cfg.lookback_secs as i64);
        let recent: Vec<&CommandEvent> = window
            .commands
            .iter()
            .filter(|c| c.ts >= cutoff)
            .collect();

        let mut requests = Vec::new();

        let checks = [
            Self::check_error_loop(&self.cfg, &recent),
            Self::check_repeated_failure(&self.cfg, &recent),
            Self::check_build_thrash(&self.cfg, &recent),
        ];

        for finding in checks.into_iter().flatten() {
            if self.should_fire(finding.anomaly, &finding.dir, now) {
                tracing::info!(
                    anomaly = %finding.anomaly.as_str(),
                    dir = %finding.dir,
                    "Anomaly detected"
                );
                requests.push(InterventionRequest {
                    anomaly: finding.anomaly,
                    triggered_at: now,
                    trigger_context: finding.context,
                });
            }
        }

        requests
    }

    /// Cooldown gate per (anomaly type, directory). Recording happens here
    /// so a request that fires starts its cooldown immediately.
    fn should_fire(&mut self, anomaly: AnomalyKind, dir: &str, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(self.cfg.cooldown_secs as i64);
        let key = (anomaly, dir.to_string());
        if let Some(last) = self.last_fired.get(&key) {
            if now - *last < cooldown {
                tracing::debug!(anomaly = %anomaly.as_str(), "Anomaly in cooldown, skipping");
                return false;
            }
        }
        self.last_fired.insert(key, now);
        true
    }

    /// Same command failing back to back
    fn check_error_loop(cfg: &AnomalyConfig, recent: &[&CommandEvent]) -> Option<Finding> {
        let mut groups: BTreeMap<&str, Vec<&CommandEvent>> = BTreeMap::new();
        for cmd in recent.iter().copied().filter(|c| c.failed()) {
            groups.entry(&cmd.sanitized_command).or_default().push(cmd);
        }

        let (command, hits) = groups
            .into_iter()
            .max_by_key(|(command, hits)| (hits.len(), std::cmp::Reverse(*command)))?;
        if hits.len() < cfg.repeat_threshold {
            return None;
        }

        let last = hits[hits.len() - 1];
        Some(Finding {
            anomaly: AnomalyKind::ErrorLoop,
            dir: last.sanitized_pwd.clone(),
            context: json!({
                "command": command,
                "count": hits.len(),
                "window_secs": cfg.lookback_secs,
                "severity": if hits.len() >= cfg.repeat_threshold + 2 { "high" } else { "medium" },
                "recent_failures": failure_digest(&hits),
            }),
        })
    }

    /// Failure rate above threshold across enough commands
    fn check_repeated_failure(cfg: &AnomalyConfig, recent: &[&CommandEvent]) -> Option<Finding> {
        if recent.len() < cfg.min_commands {
            return None;
        }

        let failed: Vec<&&CommandEvent> = recent.iter().filter(|c| c.failed()).collect();
        let rate = failed.len() as f64 / recent.len() as f64;
        if failed.len() < cfg.repeat_threshold || rate <= cfg.failure_rate {
            return None;
        }

        let dir = dominant_dir(&failed)?;
        Some(Finding {
            anomaly: AnomalyKind::RepeatedFailure,
            dir,
            context: json!({
                "failed_count": failed.len(),
                "total_count": recent.len(),
                "error_rate": rate,
                "window_secs": cfg.lookback_secs,
                "severity": if rate > 0.7 { "high" } else { "medium" },
                "recent_failures": failure_digest(&failed.iter().map(|c| **c).collect::<Vec<_>>()),
            }),
        })
    }

    /// Repeated failing build/test invocations
    fn check_build_thrash(cfg: &AnomalyConfig, recent: &[&CommandEvent]) -> Option<Finding> {
        let failed_builds: Vec<&&CommandEvent> = recent
            .iter()
            .filter(|c| {
                c.failed() && {
                    let lower = c.sanitized_command.to_lowercase();
                    BUILD_PATTERNS.iter().any(|p| lower.contains(p))
                }
            })
            .collect();

        if failed_builds.len() < cfg.build_failure_threshold {
            return None;
        }

        let dir = dominant_dir(&failed_builds)?;
        Some(Finding {
            anomaly: AnomalyKind::BuildThrash,
            dir,
            context: json!({
                "failed_count": failed_builds.len(),
                "window_secs": cfg.lookback_secs,
                "commands": failed_builds
                    .iter()
                    .take(5)
                    .map(|c| c.sanitized_command.clone())
                    .collect::<Vec<_>>(),
            }),
        })
    }
}

struct Finding {
    anomaly: AnomalyKind,
    dir: String,
    context: serde_json::Value,
}

/// Sanitized digest of recent failures, capped at ten entries
fn failure_digest(hits: &[&CommandEvent]) -> Vec<serde_json::Value> {
    hits.iter()
        .rev()
        .take(10)
        .map(|c| {
            json!({
                "command": c.sanitized_command,
                "exit_code": c.exit_code,
                "ts": c.ts.to_rfc3339(),
                "pwd": c.sanitized_pwd,
            })
        })
        .collect()
}

/// The most common sanitized working directory among the given commands
fn dominant_dir(commands: &[&&CommandEvent]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for cmd in commands {
        *counts.entry(&cmd.sanitized_pwd).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(dir, count)| (*count, std::cmp::Reverse(*dir)))
        .map(|(dir, _)| dir.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::WindowState;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn window_with_commands(specs: &[(i64, &str, i32)]) -> WindowState {
        let mut window = WindowState::new();
        for (secs, cmd, exit_code) in specs {
            window.insert(ObserverEvent::Command(CommandEvent {
                command: cmd.to_string(),
                sanitized_command: cmd.to_string(),
                pwd: "/home/dev/app".to_string(),
                sanitized_pwd: "/home/dev/app".to_string(),
                ts: t(*secs),
                duration: 0.1,
                exit_code: *exit_code,
            }));
        }
        window
    }

    #[test]
    fn test_error_loop_fires_once_then_cooldown() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        let window = window_with_commands(&[
            (0, "cat missing.py", 1),
            (4, "cat missing.py", 1),
            (9, "cat missing.py", 1),
        ]);

        let fired = detector.scan(&window, t(10));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].anomaly, AnomalyKind::ErrorLoop);
        assert_eq!(fired[0].trigger_context["count"], 3);

        // A fourth identical failure within the cooldown fires nothing.
        let window = window_with_commands(&[
            (0, "cat missing.py", 1),
            (4, "cat missing.py", 1),
            (9, "cat missing.py", 1),
            (15, "cat missing.py", 1),
        ]);
        let fired = detector.scan(&window, t(16));
        assert!(fired.is_empty());
    }

    #[test]
    fn test_error_loop_refires_after_cooldown() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        let window = window_with_commands(&[
            (0, "cat missing.py", 1),
            (4, "cat missing.py", 1),
            (9, "cat missing.py", 1),
        ]);
        assert_eq!(detector.scan(&window, t(10)).len(), 1);

        let later = 10 + AnomalyConfig::default().cooldown_secs as i64 + 1;
        let window = window_with_commands(&[
            (later - 9, "cat missing.py", 1),
            (later - 5, "cat missing.py", 1),
            (later - 1, "cat missing.py", 1),
        ]);
        assert_eq!(detector.scan(&window, t(later)).len(), 1);
    }

    #[test]
    fn test_repeated_failure_needs_rate_and_volume() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());

        // Four commands is under min_commands
        let window = window_with_commands(&[
            (0, "a", 1),
            (1, "b", 1),
            (2, "c", 1),
            (3, "d", 0),
        ]);
        assert!(detector.scan(&window, t(5)).is_empty());

        // Six commands, four distinct failures: rate 0.66
        let window = window_with_commands(&[
            (0, "a", 1),
            (1, "b", 1),
            (2, "c", 1),
            (3, "d", 1),
            (4, "e", 0),
            (5, "f", 0),
        ]);
        let fired = detector.scan(&window, t(6));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].anomaly, AnomalyKind::RepeatedFailure);
        assert_eq!(fired[0].trigger_context["failed_count"], 4);
    }

    #[test]
    fn test_build_thrash() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        let window = window_with_commands(&[
            (0, "cargo build", 101),
            (10, "cargo build", 101),
            (20, "make", 2),
            (30, "pytest tests/", 1),
            (40, "cargo test", 101),
            (50, "ls", 0),
            (55, "ls -la", 0),
        ]);

        let fired = detector.scan(&window, t(60));
        let kinds: Vec<AnomalyKind> = fired.iter().map(|f| f.anomaly).collect();
        assert!(kinds.contains(&AnomalyKind::BuildThrash));
        // Five failures among seven commands also trips the rate check;
        // the two anomaly types are independent views.
        assert!(kinds.contains(&AnomalyKind::RepeatedFailure));
    }

    #[test]
    fn test_lookback_excludes_old_commands() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        // Two failures long ago, one recent: no loop in the lookback
        let window = window_with_commands(&[
            (0, "cat missing.py", 1),
            (5, "cat missing.py", 1),
            (500, "cat missing.py", 1),
        ]);
        assert!(detector.scan(&window, t(501)).is_empty());
    }

    #[test]
    fn test_trigger_context_is_sanitized() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        let mut window = WindowState::new();
        for secs in [0, 4, 9] {
            window.insert(ObserverEvent::Command(CommandEvent {
                command: "mysql -u root -ppassword=hunter2".to_string(),
                sanitized_command: "mysql -u root -p[REDACTED:password]".to_string(),
                pwd: "/home/dev/app".to_string(),
                sanitized_pwd: "/home/dev/app".to_string(),
                ts: t(secs),
                duration: 0.1,
                exit_code: 1,
            }));
        }

        let fired = detector.scan(&window, t(10));
        assert_eq!(fired.len(), 1);
        let rendered = fired[0].trigger_context.to_string();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED:password]"));
    }
}
