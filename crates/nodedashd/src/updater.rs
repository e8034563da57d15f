//! Update source trait - abstraction over checking for and installing releases.
//!
//! The orchestrator only sequences and reports; fetching and verifying the
//! release is delegated. Production uses `CommandUpdater`, which shells out to
//! the distribution's update helpers. Tests use `FakeUpdateSource`.

use crate::update::ProgressReporter;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nodedash_common::config::UpdateConfig;
use nodedash_common::UpdateStage;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What a check found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateCheck {
    /// Newer release, if any
    pub available_version: Option<String>,
    /// Version of the binary currently on disk, when the source knows it
    pub installed_version: Option<String>,
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn check(&self) -> Result<UpdateCheck>;

    /// Fetch, verify and install `version`, reporting through `progress`.
    /// The error text is kept verbatim as the failure detail.
    async fn apply(&self, version: &str, progress: &ProgressReporter) -> Result<()>;
}

/// Runs external helpers.
///
/// The check helper prints the available version on its first line (empty when
/// up to date) and may print the installed version on a second. The apply
/// helper receives the version as its last argument and writes progress lines
/// of the form `<stage> <percent> [message]` to stdout; whatever it writes to
/// stderr becomes the failure detail.
pub struct CommandUpdater {
    check_command: String,
    apply_command: String,
}

impl CommandUpdater {
    pub fn new(check_command: impl Into<String>, apply_command: impl Into<String>) -> Self {
        Self {
            check_command: check_command.into(),
            apply_command: apply_command.into(),
        }
    }

    pub fn from_config(config: &UpdateConfig) -> Self {
        Self::new(&config.check_command, &config.apply_command)
    }
}

fn command_for(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("update command is not configured");
    };
    let mut cmd = Command::new(program);
    cmd.args(parts).kill_on_drop(true);
    Ok(cmd)
}

#[async_trait]
impl UpdateSource for CommandUpdater {
    async fn check(&self) -> Result<UpdateCheck> {
        let output = command_for(&self.check_command)?
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.check_command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{}", failure_text(&stderr, output.status));
        }
        Ok(parse_check_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn apply(&self, version: &str, progress: &ProgressReporter) -> Result<()> {
        let mut child = command_for(&self.apply_command)?
            .arg(version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.apply_command))?;

        // Drained concurrently so a chatty helper can't block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            // Split on raw bytes; helpers may pass through non-UTF-8 tool output
            let mut segments = BufReader::new(stdout).split(b'\n');
            while let Some(raw) = segments.next_segment().await? {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches('\r');
                match parse_progress_line(line) {
                    Some((stage, percentage, message)) => {
                        progress.report(stage, percentage, message).await
                    }
                    None => debug!("update helper: {}", line),
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            bail!("{}", failure_text(&stderr, status));
        }
        if !stderr.trim().is_empty() {
            warn!("update helper stderr: {}", stderr.trim());
        }
        Ok(())
    }
}

fn failure_text(stderr: &str, status: std::process::ExitStatus) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("update helper exited with {}", status)
    } else {
        stderr.to_string()
    }
}

pub fn parse_check_output(stdout: &str) -> UpdateCheck {
    let mut lines = stdout.lines().map(str::trim);
    let non_empty = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
    let available_version = non_empty(lines.next());
    let installed_version = non_empty(lines.next());
    UpdateCheck {
        available_version,
        installed_version,
    }
}

/// `<stage> <percent> [message]`, e.g. `downloading 42 fetching bundle`.
/// Only the in-run stages are accepted.
pub fn parse_progress_line(line: &str) -> Option<(UpdateStage, f64, String)> {
    let line = line.trim();
    let (stage, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (percentage, message) = match rest.split_once(char::is_whitespace) {
        Some((p, m)) => (p, m.trim()),
        None => (rest, ""),
    };

    let stage = UpdateStage::parse(stage)?;
    if !matches!(
        stage,
        UpdateStage::Checking
            | UpdateStage::Downloading
            | UpdateStage::Verifying
            | UpdateStage::Applying
            | UpdateStage::Complete
    ) {
        return None;
    }
    let percentage = percentage.trim_end_matches('%').parse::<f64>().ok()?;
    Some((stage, percentage, message.to_string()))
}

/// Scripted update source
pub struct FakeUpdateSource {
    check: UpdateCheck,
    steps: Vec<(UpdateStage, f64, String)>,
    failure: Option<String>,
    check_failure: Option<String>,
    gate: Option<Arc<Notify>>,
    apply_calls: AtomicUsize,
}

impl FakeUpdateSource {
    pub fn available(version: impl Into<String>) -> Self {
        Self {
            check: UpdateCheck {
                available_version: Some(version.into()),
                installed_version: None,
            },
            steps: Vec::new(),
            failure: None,
            check_failure: None,
            gate: None,
            apply_calls: AtomicUsize::new(0),
        }
    }

    pub fn up_to_date() -> Self {
        Self {
            check: UpdateCheck::default(),
            ..Self::available("")
        }
    }

    pub fn with_installed(mut self, version: impl Into<String>) -> Self {
        self.check.installed_version = Some(version.into());
        self
    }

    pub fn with_steps<S: Into<String>>(mut self, steps: Vec<(UpdateStage, f64, S)>) -> Self {
        self.steps = steps
            .into_iter()
            .map(|(stage, pct, msg)| (stage, pct, msg.into()))
            .collect();
        self
    }

    /// Apply reports its steps, then fails with `raw`
    pub fn failing_with(mut self, raw: impl Into<String>) -> Self {
        self.failure = Some(raw.into());
        self
    }

    /// Check fails with `raw`
    pub fn check_failing_with(mut self, raw: impl Into<String>) -> Self {
        self.check_failure = Some(raw.into());
        self
    }

    /// Apply blocks until `gate` is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource for FakeUpdateSource {
    async fn check(&self) -> Result<UpdateCheck> {
        match &self.check_failure {
            Some(raw) => bail!("{}", raw),
            None => Ok(self.check.clone()),
        }
    }

    async fn apply(&self, _version: &str, progress: &ProgressReporter) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        for (stage, percentage, message) in &self.steps {
            progress.report(*stage, *percentage, message.clone()).await;
        }
        match &self.failure {
            Some(raw) => bail!("{}", raw),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use crate::status_store::StatusStore;
    use chrono::Utc;
    use nodedash_common::UpdateStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn reporter() -> (Arc<StatusStore>, ProgressReporter) {
        let status = Arc::new(StatusStore::new());
        let reporter = ProgressReporter::new(
            Arc::clone(&status),
            Arc::new(EventHub::default()),
            UpdateStatus::idle("1.0.0", "1.2.0"),
            Utc::now(),
        );
        (status, reporter)
    }

    fn script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", body).unwrap();
        file
    }

    fn sh(file: &NamedTempFile) -> String {
        format!("sh {}", file.path().display())
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("downloading 42 fetching bundle"),
            Some((UpdateStage::Downloading, 42.0, "fetching bundle".to_string()))
        );
        assert_eq!(
            parse_progress_line("  verifying   75%  "),
            Some((UpdateStage::Verifying, 75.0, String::new()))
        );
        assert_eq!(parse_progress_line("restarting 0"), None);
        assert_eq!(parse_progress_line("downloading lots"), None);
        assert_eq!(parse_progress_line("plain log output"), None);
        assert_eq!(parse_progress_line(""), None);
    }

    #[test]
    fn test_parse_check_output() {
        assert_eq!(parse_check_output(""), UpdateCheck::default());
        assert_eq!(
            parse_check_output("1.2.0\n"),
            UpdateCheck {
                available_version: Some("1.2.0".to_string()),
                installed_version: None,
            }
        );
        assert_eq!(
            parse_check_output("\n1.1.0\n"),
            UpdateCheck {
                available_version: None,
                installed_version: Some("1.1.0".to_string()),
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_check_reads_versions() {
        let check = script("echo 1.2.0\necho 1.1.0");
        let updater = CommandUpdater::new(sh(&check), "true");
        let found = updater.check().await.unwrap();
        assert_eq!(found.available_version.as_deref(), Some("1.2.0"));
        assert_eq!(found.installed_version.as_deref(), Some("1.1.0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_apply_reports_progress() {
        let apply = script(
            "echo \"downloading 10 fetching $1\"\necho noise\necho \"verifying 50\"\necho \"applying 80 installing\"",
        );
        let updater = CommandUpdater::new("true", sh(&apply));
        let (status, reporter) = reporter();

        updater.apply("1.2.0", &reporter).await.unwrap();

        assert_eq!(reporter.stage(), UpdateStage::Applying);
        assert_eq!(reporter.percentage(), 80.0);
        let snapshot = status.get().await;
        assert!(snapshot.in_progress);
        assert_eq!(snapshot.message, "installing");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_apply_failure_keeps_stderr() {
        let apply = script("echo \"downloading 30\"\necho 'sha256 checksum mismatch' >&2\nexit 3");
        let updater = CommandUpdater::new("true", sh(&apply));
        let (_, reporter) = reporter();

        let err = updater.apply("1.2.0", &reporter).await.unwrap_err();
        assert_eq!(err.to_string(), "sha256 checksum mismatch");
        assert_eq!(reporter.percentage(), 30.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_apply_survives_binary_output() {
        let apply = script(
            "echo \"downloading 10\"\nprintf '\\377\\376 raw bytes\\n'\necho \"applying 90 done\"\nexit 0",
        );
        let updater = CommandUpdater::new("true", sh(&apply));
        let (_, reporter) = reporter();

        updater.apply("1.2.0", &reporter).await.unwrap();
        assert_eq!(reporter.stage(), UpdateStage::Applying);
        assert_eq!(reporter.percentage(), 90.0);
    }

    #[tokio::test]
    async fn test_unconfigured_command_is_an_error() {
        let updater = CommandUpdater::new("", "");
        assert!(updater.check().await.is_err());
    }
}
