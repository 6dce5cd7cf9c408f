//! Git-context producer
//!
//! Follows the user's working directory (the pwd of the most recent shell
//! command) and probes git state when it changes, or every few minutes for
//! an unchanged directory. Probe results go to the daemon socket as wire
//! records; branch classification happens at the ingestion boundary like
//! for any other producer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use worklens_core::config::CollectorsConfig;
use worklens_core::ingest::WireRecord;
use worklens_core::Database;

use crate::transport;

/// How often the most recent pwd is checked
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on a single git invocation
const GIT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GitProbe {
    socket: PathBuf,
    db: Arc<Database>,
    recheck: chrono::Duration,
}

impl GitProbe {
    pub fn new(socket: PathBuf, db: Arc<Database>, cfg: &CollectorsConfig) -> Self {
        Self {
            socket,
            db,
            recheck: chrono::Duration::seconds(cfg.git_recheck_secs as i64),
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_pwd: Option<String> = None;
        let mut last_probe = Utc::now() - self.recheck;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let Some(pwd) = self.current_pwd() else {
                continue;
            };

            let due = Utc::now() - last_probe >= self.recheck;
            if last_pwd.as_deref() == Some(pwd.as_str()) && !due {
                continue;
            }
            last_pwd = Some(pwd.clone());
            last_probe = Utc::now();

            if let Some((repo_path, branch)) = probe_repo(&pwd).await {
                let record = WireRecord::Git {
                    ts: transport::now_epoch(),
                    repo_path,
                    branch,
                };
                if !transport::send_record(&self.socket, &record) {
                    tracing::debug!("Git context dropped (daemon unreachable)");
                }
            }
        }

        tracing::info!("Git prober stopped");
    }

    /// The working directory of the most recent observed command
    fn current_pwd(&self) -> Option<String> {
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(10);
        self.db
            .commands_in_range(start, end, 1)
            .ok()?
            .into_iter()
            .next()
            .map(|c| c.pwd)
    }
}

/// Resolve (repo root, current branch) for a directory, or None when it is
/// not inside a work tree, git is missing, or the probe is too slow.
async fn probe_repo(pwd: &str) -> Option<(String, String)> {
    let repo_path = git_output(pwd, &["rev-parse", "--show-toplevel"]).await?;
    let branch = git_output(pwd, &["branch", "--show-current"]).await?;
    if branch.is_empty() {
        // Detached HEAD; nothing meaningful to classify
        return None;
    }
    Some((repo_path, branch))
}

async fn git_output(pwd: &str, args: &[&str]) -> Option<String> {
    let child = tokio::process::Command::new("git")
        .args(args)
        .current_dir(pwd)
        .output();

    let output = tokio::time::timeout(GIT_TIMEOUT, child).await.ok()?.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
