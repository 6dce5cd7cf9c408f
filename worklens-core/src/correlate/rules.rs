//! Correlation rules
//!
//! Each rule independently inspects the current window and proposes zero or
//! one candidate episode per tick. Rules never see raw unredacted text in
//! their output path: descriptions and detail payloads are built from the
//! sanitized columns only.

use super::WindowState;
use crate::config::CorrelatorConfig;
use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// A proposed episode, half-open `[start_ts, end_ts)`
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: AggregateKind,
    pub description: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// One correlation rule over the rolling window.
///
/// A rule that fails only loses its own tick; the others still run.
pub trait CorrelationRule: Send {
    fn kind(&self) -> AggregateKind;
    fn evaluate(&self, window: &WindowState) -> Result<Option<Candidate>>;
}

/// The standard rule set, thresholds taken from configuration.
pub fn default_rules(cfg: &CorrelatorConfig) -> Vec<Box<dyn CorrelationRule>> {
    vec![
        Box::new(ErrorLoopRule {
            threshold: cfg.error_loop_threshold,
        }),
        Box::new(ActiveEditingRule {
            threshold: cfg.editing_file_threshold,
        }),
        Box::new(DocWritingRule {
            threshold: cfg.doc_file_threshold,
        }),
        Box::new(GitBurstRule {
            threshold: cfg.git_burst_threshold,
        }),
        Box::new(ContextSwitchRule),
    ]
}

/// Cover the last contributing event's second in a half-open interval
fn closing(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts + Duration::seconds(1)
}

// ============================================
// error_loop: same command failing repeatedly
// ============================================

struct ErrorLoopRule {
    threshold: usize,
}

impl CorrelationRule for ErrorLoopRule {
    fn kind(&self) -> AggregateKind {
        AggregateKind::ErrorLoop
    }

    fn evaluate(&self, window: &WindowState) -> Result<Option<Candidate>> {
        let mut groups: BTreeMap<&str, Vec<&CommandEvent>> = BTreeMap::new();
        for cmd in window.commands.iter().filter(|c| c.failed()) {
            groups.entry(&cmd.sanitized_command).or_default().push(cmd);
        }

        let Some((command, hits)) = groups
            .into_iter()
            .max_by_key(|(command, hits)| (hits.len(), std::cmp::Reverse(*command)))
        else {
            return Ok(None);
        };

        if hits.len() < self.threshold {
            return Ok(None);
        }

        let first = hits[0];
        let last = hits[hits.len() - 1];
        Ok(Some(Candidate {
            kind: AggregateKind::ErrorLoop,
            description: format!("Same command failed {} times: {}", hits.len(), command),
            start_ts: first.ts,
            end_ts: closing(last.ts),
            details: json!({
                "command": command,
                "count": hits.len(),
                "exit_codes": hits.iter().map(|c| c.exit_code).collect::<Vec<_>>(),
            }),
        }))
    }
}

// ============================================
// active_editing: edits concentrated under one directory
// ============================================

struct ActiveEditingRule {
    threshold: usize,
}

impl CorrelationRule for ActiveEditingRule {
    fn kind(&self) -> AggregateKind {
        AggregateKind::ActiveEditing
    }

    fn evaluate(&self, window: &WindowState) -> Result<Option<Candidate>> {
        // Directories known to the window: command pwds and git repo roots.
        // Maps raw path (for matching) to a sanitized display form.
        let mut dirs: BTreeMap<&str, &str> = BTreeMap::new();
        for cmd in &window.commands {
            dirs.entry(&cmd.pwd).or_insert(&cmd.sanitized_pwd);
        }
        for ctx in &window.git {
            dirs.entry(&ctx.repo_path).or_insert(&ctx.repo_path);
        }

        let mut best: Option<(&str, &str, Vec<&FileEvent>)> = None;
        for (dir, display) in dirs {
            let edits: Vec<&FileEvent> = window
                .files
                .iter()
                .filter(|f| {
                    matches!(f.kind, FileEventKind::Modified | FileEventKind::Created)
                        && is_under(&f.path, dir)
                })
                .collect();
            let distinct: BTreeSet<&str> = edits.iter().map(|f| f.path.as_str()).collect();
            if distinct.len() >= self.threshold
                && best
                    .as_ref()
                    .map(|(_, _, b)| distinct.len() > distinct_count(b))
                    .unwrap_or(true)
            {
                best = Some((dir, display, edits));
            }
        }

        let Some((_, display, edits)) = best else {
            return Ok(None);
        };

        let first = edits.iter().map(|f| f.ts).min().unwrap_or_else(Utc::now);
        let last = edits.iter().map(|f| f.ts).max().unwrap_or_else(Utc::now);

        // A commit inside the edit run punctuates the session; git_burst
        // covers that shape instead.
        let committed = window.commands.iter().any(|c| {
            c.sanitized_command.to_lowercase().contains("git commit")
                && c.ts >= first
                && c.ts <= last
        });
        if committed {
            return Ok(None);
        }

        let distinct: BTreeSet<&str> = edits.iter().map(|f| f.sanitized_path.as_str()).collect();
        Ok(Some(Candidate {
            kind: AggregateKind::ActiveEditing,
            description: format!("Active editing session: {} files under {}", distinct.len(), display),
            start_ts: first,
            end_ts: closing(last),
            details: json!({
                "dir": display,
                "file_count": distinct.len(),
                "extensions": extension_histogram(&distinct),
            }),
        }))
    }
}

fn distinct_count(edits: &[&FileEvent]) -> usize {
    edits
        .iter()
        .map(|f| f.path.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Path-segment-aware prefix check
fn is_under(path: &str, dir: &str) -> bool {
    match path.strip_prefix(dir) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || dir.ends_with('/'),
        None => false,
    }
}

fn extension_histogram(paths: &BTreeSet<&str>) -> BTreeMap<String, usize> {
    let mut histogram = BTreeMap::new();
    for path in paths {
        if let Some((_, ext)) = path.rsplit_once('.') {
            if !ext.contains('/') {
                *histogram.entry(ext.to_string()).or_insert(0) += 1;
            }
        }
    }
    histogram
}

// ============================================
// doc_writing: markdown-heavy editing
// ============================================

struct DocWritingRule {
    threshold: usize,
}

impl CorrelationRule for DocWritingRule {
    fn kind(&self) -> AggregateKind {
        AggregateKind::DocWriting
    }

    fn evaluate(&self, window: &WindowState) -> Result<Option<Candidate>> {
        let edits: Vec<&FileEvent> = window
            .files
            .iter()
            .filter(|f| {
                matches!(f.kind, FileEventKind::Modified | FileEventKind::Created)
                    && f.path.ends_with(".md")
            })
            .collect();

        let distinct: BTreeSet<&str> = edits.iter().map(|f| f.sanitized_path.as_str()).collect();
        if distinct.len() < self.threshold {
            return Ok(None);
        }

        let first = edits.iter().map(|f| f.ts).min().unwrap_or_else(Utc::now);
        let last = edits.iter().map(|f| f.ts).max().unwrap_or_else(Utc::now);

        Ok(Some(Candidate {
            kind: AggregateKind::DocWriting,
            description: format!("Documentation writing: {} markdown files edited", distinct.len()),
            start_ts: first,
            end_ts: closing(last),
            details: json!({ "file_count": distinct.len() }),
        }))
    }
}

// ============================================
// git_burst: dense run of commits/pushes
// ============================================

struct GitBurstRule {
    threshold: usize,
}

impl CorrelationRule for GitBurstRule {
    fn kind(&self) -> AggregateKind {
        AggregateKind::GitBurst
    }

    fn evaluate(&self, window: &WindowState) -> Result<Option<Candidate>> {
        let ops: Vec<&CommandEvent> = window
            .commands
            .iter()
            .filter(|c| {
                let lower = c.sanitized_command.to_lowercase();
                lower.contains("git commit") || lower.contains("git push")
            })
            .collect();

        if ops.len() < self.threshold {
            return Ok(None);
        }

        Ok(Some(Candidate {
            kind: AggregateKind::GitBurst,
            description: format!("Active git operations: {} commits/pushes", ops.len()),
            start_ts: ops[0].ts,
            end_ts: closing(ops[ops.len() - 1].ts),
            details: json!({ "operation_count": ops.len() }),
        }))
    }
}

// ============================================
// context_switch: branch-type change
// ============================================

struct ContextSwitchRule;

impl CorrelationRule for ContextSwitchRule {
    fn kind(&self) -> AggregateKind {
        AggregateKind::ContextSwitch
    }

    fn evaluate(&self, window: &WindowState) -> Result<Option<Candidate>> {
        // Most recent adjacent pair with differing branch type
        let switch = window
            .git
            .windows(2)
            .rev()
            .find(|pair| pair[0].branch_kind != pair[1].branch_kind);

        let Some(pair) = switch else {
            return Ok(None);
        };
        let (from, to) = (&pair[0], &pair[1]);

        Ok(Some(Candidate {
            kind: AggregateKind::ContextSwitch,
            description: format!(
                "Context switch: {} ({}) to {} ({})",
                from.branch,
                from.branch_kind.as_str(),
                to.branch,
                to.branch_kind.as_str()
            ),
            start_ts: to.ts,
            end_ts: closing(to.ts),
            details: json!({
                "from_branch": from.branch,
                "from_kind": from.branch_kind.as_str(),
                "to_branch": to.branch,
                "to_kind": to.branch_kind.as_str(),
                "repo_path": to.repo_path,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn command(secs: i64, cmd: &str, exit_code: i32) -> CommandEvent {
        CommandEvent {
            command: cmd.to_string(),
            sanitized_command: cmd.to_string(),
            pwd: "/home/dev/app".to_string(),
            sanitized_pwd: "/home/dev/app".to_string(),
            ts: t(secs),
            duration: 0.1,
            exit_code,
        }
    }

    fn file(secs: i64, path: &str, kind: FileEventKind) -> FileEvent {
        FileEvent {
            ts: t(secs),
            path: path.to_string(),
            sanitized_path: path.to_string(),
            kind,
        }
    }

    fn git(secs: i64, branch: &str) -> GitContext {
        GitContext {
            ts: t(secs),
            repo_path: "/home/dev/app".to_string(),
            branch: branch.to_string(),
            branch_kind: BranchKind::classify(branch),
        }
    }

    #[test]
    fn test_error_loop_needs_same_command() {
        let rule = ErrorLoopRule { threshold: 3 };
        let mut window = WindowState::new();
        window.insert(ObserverEvent::Command(command(0, "cat a.py", 1)));
        window.insert(ObserverEvent::Command(command(5, "cat b.py", 1)));
        window.insert(ObserverEvent::Command(command(10, "cat c.py", 1)));
        assert!(rule.evaluate(&window).unwrap().is_none());

        let mut window = WindowState::new();
        for i in 0..3 {
            window.insert(ObserverEvent::Command(command(i * 5, "cat missing.py", 1)));
        }
        let candidate = rule.evaluate(&window).unwrap().unwrap();
        assert_eq!(candidate.kind, AggregateKind::ErrorLoop);
        assert_eq!(candidate.details["count"], 3);
        assert_eq!(candidate.start_ts, t(0));
        assert_eq!(candidate.end_ts, t(11));
    }

    #[test]
    fn test_error_loop_ignores_successes() {
        let rule = ErrorLoopRule { threshold: 3 };
        let mut window = WindowState::new();
        for i in 0..5 {
            window.insert(ObserverEvent::Command(command(i, "cargo build", 0)));
        }
        assert!(rule.evaluate(&window).unwrap().is_none());
    }

    #[test]
    fn test_active_editing_concentrated_under_dir() {
        let rule = ActiveEditingRule { threshold: 3 };
        let mut window = WindowState::new();
        window.insert(ObserverEvent::Command(command(0, "ls", 0)));
        for (i, name) in ["a.rs", "b.rs", "c.rs"].iter().enumerate() {
            window.insert(ObserverEvent::File(file(
                (i as i64) * 10 + 1,
                &format!("/home/dev/app/src/{}", name),
                FileEventKind::Modified,
            )));
        }

        let candidate = rule.evaluate(&window).unwrap().unwrap();
        assert_eq!(candidate.kind, AggregateKind::ActiveEditing);
        assert_eq!(candidate.details["file_count"], 3);
        assert_eq!(candidate.details["dir"], "/home/dev/app");
        assert_eq!(candidate.details["extensions"]["rs"], 3);
    }

    #[test]
    fn test_active_editing_suppressed_by_commit() {
        let rule = ActiveEditingRule { threshold: 3 };
        let mut window = WindowState::new();
        window.insert(ObserverEvent::Command(command(0, "ls", 0)));
        for (i, name) in ["a.rs", "b.rs", "c.rs"].iter().enumerate() {
            window.insert(ObserverEvent::File(file(
                (i as i64) * 10 + 1,
                &format!("/home/dev/app/src/{}", name),
                FileEventKind::Modified,
            )));
        }
        window.insert(ObserverEvent::Command(command(
            15,
            "git commit -m wip",
            0,
        )));

        assert!(rule.evaluate(&window).unwrap().is_none());
    }

    #[test]
    fn test_active_editing_requires_path_segment_boundary() {
        assert!(is_under("/home/dev/app/src/a.rs", "/home/dev/app"));
        assert!(!is_under("/home/dev/app-backup/a.rs", "/home/dev/app"));
        assert!(is_under("/home/dev/app", "/home/dev/app"));
    }

    #[test]
    fn test_doc_writing() {
        let rule = DocWritingRule { threshold: 2 };
        let mut window = WindowState::new();
        window.insert(ObserverEvent::File(file(0, "/docs/a.md", FileEventKind::Modified)));
        window.insert(ObserverEvent::File(file(5, "/docs/b.md", FileEventKind::Created)));
        window.insert(ObserverEvent::File(file(6, "/src/c.rs", FileEventKind::Modified)));

        let candidate = rule.evaluate(&window).unwrap().unwrap();
        assert_eq!(candidate.details["file_count"], 2);
    }

    #[test]
    fn test_git_burst() {
        let rule = GitBurstRule { threshold: 3 };
        let mut window = WindowState::new();
        window.insert(ObserverEvent::Command(command(0, "git commit -m one", 0)));
        window.insert(ObserverEvent::Command(command(10, "git push", 0)));
        assert!(rule.evaluate(&window).unwrap().is_none());

        window.insert(ObserverEvent::Command(command(20, "git commit -m two", 0)));
        let candidate = rule.evaluate(&window).unwrap().unwrap();
        assert_eq!(candidate.details["operation_count"], 3);
        assert_eq!(candidate.start_ts, t(0));
    }

    #[test]
    fn test_context_switch_on_branch_kind_change() {
        let rule = ContextSwitchRule;
        let mut window = WindowState::new();
        window.insert(ObserverEvent::Git(git(0, "feat/login")));
        window.insert(ObserverEvent::Git(git(60, "feat/login-retry")));
        assert!(
            rule.evaluate(&window).unwrap().is_none(),
            "same branch kind is not a switch"
        );

        window.insert(ObserverEvent::Git(git(120, "fix/crash")));
        let candidate = rule.evaluate(&window).unwrap().unwrap();
        assert_eq!(candidate.details["from_kind"], "feat");
        assert_eq!(candidate.details["to_kind"], "fix");
        assert_eq!(candidate.start_ts, t(120));
    }
}
