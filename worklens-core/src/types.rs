//! Core domain types for worklens
//!
//! These types represent the normalized data model shared by the whole
//! pipeline. Raw signals (commands, process samples, git contexts, file
//! events) are validated and sanitized once at the ingestion boundary and
//! travel as [`ObserverEvent`] from there on; nothing downstream ever sees
//! an untyped or unredacted record.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Raw event** | A single low-level signal from one producer |
//! | **Aggregated event** | A derived, time-bounded episode synthesized from raw signals |
//! | **Anomaly** | A repeating/abnormal pattern warranting an out-of-band inference call |
//! | **Analysis** | One (status, confidence, summary) judgment of the current work state |
//! | **Intervention** | The record of an anomaly-triggered inference call |
//! | **Discovered dir** | A directory learned from observed activity, candidate for watching |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Event kinds
// ============================================

/// Discriminant for the four raw signal families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Command,
    Process,
    Git,
    File,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Command => "command",
            EventKind::Process => "process",
            EventKind::Git => "git",
            EventKind::File => "file",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Raw events
// ============================================

/// A shell command observed by the shell hook.
///
/// Identity is (ts, pwd, command); near-duplicates from a misbehaving
/// producer are collapsed by the correlator, not rejected by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Original command line
    pub command: String,
    /// Redacted command line (always present before persistence)
    pub sanitized_command: String,
    /// Working directory at execution time
    pub pwd: String,
    /// Redacted working directory
    pub sanitized_pwd: String,
    /// Producer-declared timestamp
    pub ts: DateTime<Utc>,
    /// Execution duration in seconds
    pub duration: f64,
    /// Process exit code
    pub exit_code: i32,
}

impl CommandEvent {
    /// Whether the command exited nonzero
    pub fn failed(&self) -> bool {
        self.exit_code != 0
    }
}

/// One sampled process observation.
///
/// PIDs are reused by the OS and are not a stable identity across samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    pub ts: DateTime<Utc>,
    pub name: String,
    pub pid: i32,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Branch-type tag derived from a branch-name prefix taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Fix,
    Feat,
    Chore,
    Other,
}

impl BranchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchKind::Fix => "fix",
            BranchKind::Feat => "feat",
            BranchKind::Chore => "chore",
            BranchKind::Other => "other",
        }
    }

    /// Classify a branch name by its prefix
    pub fn classify(branch: &str) -> Self {
        let lower = branch.to_ascii_lowercase();
        if ["fix/", "bugfix/", "hotfix/"]
            .iter()
            .any(|p| lower.starts_with(p))
        {
            BranchKind::Fix
        } else if ["feat/", "feature/"].iter().any(|p| lower.starts_with(p)) {
            BranchKind::Feat
        } else if lower.starts_with("chore/") {
            BranchKind::Chore
        } else {
            BranchKind::Other
        }
    }
}

impl std::str::FromStr for BranchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fix" => Ok(BranchKind::Fix),
            "feat" => Ok(BranchKind::Feat),
            "chore" => Ok(BranchKind::Chore),
            "other" => Ok(BranchKind::Other),
            _ => Err(format!("unknown branch kind: {}", s)),
        }
    }
}

/// Git repository context observed by the prober
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitContext {
    pub ts: DateTime<Utc>,
    /// Repository root path
    pub repo_path: String,
    /// Current branch name
    pub branch: String,
    /// Derived branch-type tag
    pub branch_kind: BranchKind,
}

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Modified => "modified",
            FileEventKind::Deleted => "deleted",
            FileEventKind::Renamed => "renamed",
        }
    }
}

impl std::str::FromStr for FileEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(FileEventKind::Created),
            "modified" => Ok(FileEventKind::Modified),
            "deleted" => Ok(FileEventKind::Deleted),
            "renamed" => Ok(FileEventKind::Renamed),
            _ => Err(format!("unknown file event kind: {}", s)),
        }
    }
}

/// A filesystem change under a watched directory.
///
/// Path sanitization only redacts secret-looking substrings embedded in the
/// path; the path structure itself is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    pub ts: DateTime<Utc>,
    pub path: String,
    pub sanitized_path: String,
    pub kind: FileEventKind,
}

// ============================================
// The normalized event union
// ============================================

/// A validated, sanitized raw event.
///
/// Produced only by the ingestion boundary; the pipeline does not know (or
/// care) whether a variant originated from a timer, a socket write, or a
/// filesystem notification.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Command(CommandEvent),
    Process(ProcessSample),
    Git(GitContext),
    File(FileEvent),
}

impl ObserverEvent {
    /// Producer-declared timestamp of this event
    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            ObserverEvent::Command(e) => e.ts,
            ObserverEvent::Process(e) => e.ts,
            ObserverEvent::Git(e) => e.ts,
            ObserverEvent::File(e) => e.ts,
        }
    }

    /// Kind discriminant
    pub fn kind(&self) -> EventKind {
        match self {
            ObserverEvent::Command(_) => EventKind::Command,
            ObserverEvent::Process(_) => EventKind::Process,
            ObserverEvent::Git(_) => EventKind::Git,
            ObserverEvent::File(_) => EventKind::File,
        }
    }
}

// ============================================
// Aggregated events (derived)
// ============================================

/// Kind of derived activity episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    /// Same command failing repeatedly
    ErrorLoop,
    /// Sustained file edits under one directory with no commit
    ActiveEditing,
    /// Markdown-heavy editing
    DocWriting,
    /// Dense run of commits/pushes
    GitBurst,
    /// Branch-type change between consecutive git contexts
    ContextSwitch,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::ErrorLoop => "error_loop",
            AggregateKind::ActiveEditing => "active_editing",
            AggregateKind::DocWriting => "doc_writing",
            AggregateKind::GitBurst => "git_burst",
            AggregateKind::ContextSwitch => "context_switch",
        }
    }
}

impl std::str::FromStr for AggregateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error_loop" => Ok(AggregateKind::ErrorLoop),
            "active_editing" => Ok(AggregateKind::ActiveEditing),
            "doc_writing" => Ok(AggregateKind::DocWriting),
            "git_burst" => Ok(AggregateKind::GitBurst),
            "context_switch" => Ok(AggregateKind::ContextSwitch),
            _ => Err(format!("unknown aggregate kind: {}", s)),
        }
    }
}

/// A derived, time-bounded activity episode.
///
/// The interval is half-open `[start_ts, end_ts)`. Open episodes are
/// extended by updating `end_ts` in place (single-row, keyed by id);
/// closed episodes are immutable. Same-kind intervals never overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvent {
    /// Database ID
    pub id: i64,
    pub kind: AggregateKind,
    /// Human-readable description
    pub description: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    /// Structured detail payload (rule-specific key/values)
    pub details: serde_json::Value,
}

// ============================================
// Analyses (derived)
// ============================================

/// Classified work state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Idle,
    Coding,
    Debugging,
    Learning,
    Unknown,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Idle => "idle",
            WorkStatus::Coding => "coding",
            WorkStatus::Debugging => "debugging",
            WorkStatus::Learning => "learning",
            WorkStatus::Unknown => "unknown",
        }
    }

    /// Case-insensitive parse, for inference responses
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Some(WorkStatus::Idle),
            "coding" => Some(WorkStatus::Coding),
            "debugging" => Some(WorkStatus::Debugging),
            "learning" => Some(WorkStatus::Learning),
            "unknown" => Some(WorkStatus::Unknown),
            _ => None,
        }
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s).ok_or_else(|| format!("unknown work status: {}", s))
    }
}

/// One classification result.
///
/// The most recent row is authoritative for reporting; a degraded run still
/// writes a row (status `unknown`, confidence 0) so there is never a gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Database ID
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub status: WorkStatus,
    pub summary: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

// ============================================
// Interventions (derived)
// ============================================

/// Closed set of anomaly types the detector can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Failure rate above threshold across recent commands
    RepeatedFailure,
    /// Repeated failing build/test commands
    BuildThrash,
    /// Same command failing back to back
    ErrorLoop,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::RepeatedFailure => "repeated_failure",
            AnomalyKind::BuildThrash => "build_thrash",
            AnomalyKind::ErrorLoop => "error_loop",
        }
    }
}

impl std::str::FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repeated_failure" => Ok(AnomalyKind::RepeatedFailure),
            "build_thrash" => Ok(AnomalyKind::BuildThrash),
            "error_loop" => Ok(AnomalyKind::ErrorLoop),
            _ => Err(format!("unknown anomaly kind: {}", s)),
        }
    }
}

/// Record of one anomaly-triggered inference call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    /// Database ID
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub anomaly: AnomalyKind,
    /// Sanitized snapshot that triggered the call
    pub trigger_context: serde_json::Value,
    /// Inference result (degraded on failure, never absent)
    pub analysis: serde_json::Value,
    /// Capability/tool names the service reported using
    pub tools_used: Vec<String>,
    pub confidence: f64,
}

// ============================================
// Discovered directories
// ============================================

/// A directory learned from observed activity.
///
/// Mutated in place by repeated observation (access_count only increases,
/// last_access_ts refreshed); never deleted, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDir {
    /// Directory path (unique key)
    pub path: String,
    pub is_git_repo: bool,
    pub access_count: i64,
    pub last_access_ts: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub is_active: bool,
    /// Free-text note on why this directory matters
    pub reasoning: Option<String>,
}
