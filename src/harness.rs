/// Harness side of the exit handshake.
///
/// Creates the markers, launches the monitored command, waits for it to park
/// at exit, runs the inspector against it, then releases it and records a
/// report.
use crate::config::{HarnessConfig, DONE_FILE_VAR, ENABLED_VAR, READY_FILE_VAR};
use crate::inspect;
use crate::report::{HarnessOutcome, HarnessReport, ReportError, ReportFile};
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Errors that stop a harness run before it can produce a report.
#[derive(Debug)]
pub enum HarnessError {
    /// No command to monitor was given.
    EmptyCommand,
    /// Failed to create the marker directory or files.
    Markers {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the monitored command.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to wait on the monitored command.
    Wait { source: std::io::Error },
    /// Failed to write the report file.
    Report { source: ReportError },
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::EmptyCommand => write!(f, "no command given to monitor"),
            HarnessError::Markers { path, source } => {
                write!(f, "failed to create marker {}: {}", path.display(), source)
            }
            HarnessError::Spawn { command, source } => {
                write!(f, "failed to spawn {}: {}", command, source)
            }
            HarnessError::Wait { source } => {
                write!(f, "failed to wait on monitored process: {}", source)
            }
            HarnessError::Report { source } => write!(f, "{}", source),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::EmptyCommand => None,
            HarnessError::Markers { source, .. } => Some(source),
            HarnessError::Spawn { source, .. } => Some(source),
            HarnessError::Wait { source } => Some(source),
            HarnessError::Report { source } => Some(source),
        }
    }
}

/// The ready/done marker pair for one run.
///
/// Each run gets its own directory, so runs sharing `markers.dir` never see
/// each other's markers. The directory is removed on drop.
#[derive(Debug)]
pub struct Markers {
    pub ready: PathBuf,
    pub done: PathBuf,
    _dir: TempDir,
}

impl Markers {
    /// Create both markers in a fresh directory under `dir`, or under the
    /// system temp directory.
    pub fn create(dir: Option<&Path>) -> Result<Self, HarnessError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("exit-handshake-");
        let run_dir = match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| HarnessError::Markers {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
                builder.tempdir_in(dir).map_err(|e| HarnessError::Markers {
                    path: dir.to_path_buf(),
                    source: e,
                })?
            }
            None => builder.tempdir().map_err(|e| HarnessError::Markers {
                path: std::env::temp_dir(),
                source: e,
            })?,
        };

        let markers = Self {
            ready: run_dir.path().join("ready"),
            done: run_dir.path().join("done"),
            _dir: run_dir,
        };
        for path in [&markers.ready, &markers.done] {
            std::fs::write(path, b"").map_err(|e| HarnessError::Markers {
                path: path.clone(),
                source: e,
            })?;
        }
        tracing::debug!(
            ready = %markers.ready.display(),
            done = %markers.done.display(),
            "markers created"
        );
        Ok(markers)
    }

    /// Delete the done marker, letting the monitored process finish exiting.
    pub fn release(&self) {
        match std::fs::remove_file(&self.done) {
            Ok(()) => tracing::debug!(path = %self.done.display(), "done file deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.done.display(),
                error = %e,
                "failed to delete done file"
            ),
        }
    }
}

enum ReadyWait {
    Ready,
    Exited(ExitStatus),
    TimedOut,
}

/// Poll until the ready marker disappears, the child exits, or the timeout expires.
async fn wait_for_ready(
    child: &mut Child,
    ready: &Path,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<ReadyWait, HarnessError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !ready.exists() {
            return Ok(ReadyWait::Ready);
        }
        if let Some(status) = child
            .try_wait()
            .map_err(|e| HarnessError::Wait { source: e })?
        {
            return Ok(ReadyWait::Exited(status));
        }
        if Instant::now() >= deadline {
            return Ok(ReadyWait::TimedOut);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Kill the child's whole process group, then reap it.
async fn kill_group(child: &mut Child, pid: u32) -> Result<ExitStatus, HarnessError> {
    tracing::warn!(pid, "killing monitored process group");
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!(pid, error = %e, "killpg failed, killing child directly");
        let _ = child.start_kill();
    }
    child
        .wait()
        .await
        .map_err(|e| HarnessError::Wait { source: e })
}

/// Run `command` under the exit handshake and inspect it before it terminates.
pub async fn run(
    config: &HarnessConfig,
    command: &[String],
) -> Result<HarnessReport, HarnessError> {
    let (program, args) = command.split_first().ok_or(HarnessError::EmptyCommand)?;
    let started_at = Utc::now();
    let markers = Markers::create(config.markers.dir.as_deref())?;

    let mut child = Command::new(program)
        .args(args)
        .env(READY_FILE_VAR, &markers.ready)
        .env(DONE_FILE_VAR, &markers.done)
        .env(ENABLED_VAR, "1")
        .stdin(Stdio::null())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HarnessError::Spawn {
            command: program.clone(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, command = ?command, "monitored process started");

    let mut report = HarnessReport {
        command: command.to_vec(),
        pid,
        outcome: HarnessOutcome::InspectorFailed,
        leaks: None,
        leaked_bytes: None,
        inspector_exit_code: None,
        child_exit_code: None,
        killed: false,
        started_at,
        finished_at: started_at,
    };

    let timeouts = &config.timeouts;
    match wait_for_ready(
        &mut child,
        &markers.ready,
        timeouts.poll_interval(),
        timeouts.ready_timeout(),
    )
    .await?
    {
        ReadyWait::Ready => {
            tracing::info!(pid, "monitored process is parked at exit");
            inspect_child(config, pid, &mut report).await;
            markers.release();

            match tokio::time::timeout(timeouts.exit_timeout(), child.wait()).await {
                Ok(status) => {
                    let status = status.map_err(|e| HarnessError::Wait { source: e })?;
                    report.child_exit_code = status.code();
                }
                Err(_) => {
                    tracing::warn!(
                        pid,
                        timeout_secs = timeouts.exit_timeout_secs,
                        "monitored process did not exit after release"
                    );
                    let status = kill_group(&mut child, pid).await?;
                    report.child_exit_code = status.code();
                    report.killed = true;
                }
            }
        }
        ReadyWait::Exited(status) => {
            tracing::warn!(
                pid,
                exit_code = ?status.code(),
                "monitored process exited without deleting the ready file"
            );
            report.outcome = HarnessOutcome::ExitedWithoutHandshake;
            report.child_exit_code = status.code();
        }
        ReadyWait::TimedOut => {
            tracing::warn!(
                pid,
                timeout_secs = timeouts.ready_timeout_secs,
                "ready file still present, giving up"
            );
            let status = kill_group(&mut child, pid).await?;
            report.outcome = HarnessOutcome::ReadyTimeout;
            report.child_exit_code = status.code();
            report.killed = true;
        }
    }

    report.finished_at = Utc::now();
    tracing::info!(
        pid,
        outcome = ?report.outcome,
        leaks = ?report.leaks,
        leaked_bytes = ?report.leaked_bytes,
        "harness run finished"
    );

    if let Some(path) = &config.report.path {
        ReportFile::new(path.clone())
            .write(&report)
            .map_err(|e| HarnessError::Report { source: e })?;
    }

    Ok(report)
}

/// Run the inspector and fold its result into the report.
async fn inspect_child(config: &HarnessConfig, pid: u32, report: &mut HarnessReport) {
    let output = match inspect::run_inspector(&config.inspector, pid).await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(error = %e, "inspector failed");
            report.outcome = HarnessOutcome::InspectorFailed;
            return;
        }
    };

    report.inspector_exit_code = output.exit_code;
    match output.summary() {
        Some(summary) => {
            report.leaks = Some(summary.leaks);
            report.leaked_bytes = Some(summary.bytes);
            report.outcome = if summary.is_clean() {
                HarnessOutcome::Clean
            } else {
                HarnessOutcome::Leaked
            };
        }
        None => {
            tracing::warn!(
                exit_code = ?output.exit_code,
                "inspector output has no leak summary"
            );
            report.outcome = HarnessOutcome::InspectorFailed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectorConfig;

    /// Shell child that performs the handshake itself.
    const PARKING_CHILD: &str =
        r#"rm "$READY_FILE_PATH" && while [ -e "$DONE_FILE_PATH" ]; do sleep 0.02; done; exit 0"#;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn echo_inspector(line: &str) -> InspectorConfig {
        InspectorConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), format!("echo '{line}'")],
        }
    }

    fn fast_config() -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.timeouts.poll_interval_ms = 10;
        config.timeouts.ready_timeout_secs = 10;
        config.timeouts.exit_timeout_secs = 10;
        config.inspector = echo_inspector("Process {pid}: 0 leaks for 0 total leaked bytes.");
        config
    }

    #[test]
    fn markers_are_created_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = {
            let markers = Markers::create(Some(dir.path())).unwrap();
            assert!(markers.ready.exists());
            assert!(markers.done.exists());
            (markers.ready.clone(), markers.done.clone())
        };
        assert!(!ready.exists());
        assert!(!done.exists());
    }

    #[test]
    fn markers_sharing_a_dir_are_independent() {
        let dir = TempDir::new().unwrap();
        let first = Markers::create(Some(dir.path())).unwrap();
        let second = Markers::create(Some(dir.path())).unwrap();
        assert_ne!(first.ready, second.ready);
        assert_ne!(first.done, second.done);

        drop(first);
        assert!(second.ready.exists());
        assert!(second.done.exists());
    }

    #[test]
    fn markers_in_fresh_temp_dir() {
        let markers = Markers::create(None).unwrap();
        assert_eq!(markers.ready.parent(), markers.done.parent());
        assert!(markers.ready.exists());
        markers.release();
        assert!(!markers.done.exists());
        // Releasing twice is harmless.
        markers.release();
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let err = run(&fast_config(), &[]).await.unwrap_err();
        assert!(matches!(err, HarnessError::EmptyCommand));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let command = vec!["definitely-not-a-real-program".to_string()];
        let err = run(&fast_config(), &command).await.unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn clean_run_releases_child() {
        let report = run(&fast_config(), &sh(PARKING_CHILD)).await.unwrap();
        assert_eq!(report.outcome, HarnessOutcome::Clean);
        assert_eq!(report.leaks, Some(0));
        assert_eq!(report.inspector_exit_code, Some(0));
        assert_eq!(report.child_exit_code, Some(0));
        assert!(!report.killed);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn leaks_are_reported() {
        let mut config = fast_config();
        config.inspector = echo_inspector("Process {pid}: 2 leaks for 96 total leaked bytes.");

        let report = run(&config, &sh(PARKING_CHILD)).await.unwrap();
        assert_eq!(report.outcome, HarnessOutcome::Leaked);
        assert_eq!(report.leaks, Some(2));
        assert_eq!(report.leaked_bytes, Some(96));
        assert_eq!(report.child_exit_code, Some(0));
    }

    #[tokio::test]
    async fn inspector_failure_still_releases_child() {
        let mut config = fast_config();
        config.inspector = InspectorConfig {
            command: "definitely-not-an-inspector".to_string(),
            args: vec!["{pid}".to_string()],
        };

        let report = run(&config, &sh(PARKING_CHILD)).await.unwrap();
        assert_eq!(report.outcome, HarnessOutcome::InspectorFailed);
        assert_eq!(report.child_exit_code, Some(0));
        assert!(!report.killed);
    }

    #[tokio::test]
    async fn inspector_without_summary_is_a_failure() {
        let mut config = fast_config();
        config.inspector = echo_inspector("attached to {pid}");

        let report = run(&config, &sh(PARKING_CHILD)).await.unwrap();
        assert_eq!(report.outcome, HarnessOutcome::InspectorFailed);
        assert_eq!(report.inspector_exit_code, Some(0));
    }

    #[tokio::test]
    async fn child_exiting_without_handshake() {
        let report = run(&fast_config(), &sh("exit 3")).await.unwrap();
        assert_eq!(report.outcome, HarnessOutcome::ExitedWithoutHandshake);
        assert_eq!(report.child_exit_code, Some(3));
        assert!(report.leaks.is_none());
    }

    #[tokio::test]
    async fn ready_timeout_kills_child() {
        let mut config = fast_config();
        config.timeouts.ready_timeout_secs = 0;

        let report = run(&config, &sh("sleep 30")).await.unwrap();
        assert_eq!(report.outcome, HarnessOutcome::ReadyTimeout);
        assert!(report.killed);
        assert_eq!(report.child_exit_code, None);
    }

    #[tokio::test]
    async fn exit_timeout_kills_child_after_inspection() {
        let mut config = fast_config();
        config.timeouts.exit_timeout_secs = 0;

        let report = run(&config, &sh(r#"rm "$READY_FILE_PATH" && sleep 30"#))
            .await
            .unwrap();
        assert_eq!(report.outcome, HarnessOutcome::Clean);
        assert!(report.killed);
    }

    #[tokio::test]
    async fn report_is_written_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config();
        config.markers.dir = Some(dir.path().join("markers"));
        config.report.path = Some(dir.path().join("report.json"));

        let report = run(&config, &sh(PARKING_CHILD)).await.unwrap();

        let written: HarnessReport = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written.pid, report.pid);
        assert_eq!(written.outcome, HarnessOutcome::Clean);
        // Markers were cleaned up with the run.
        let leftover: Vec<_> = std::fs::read_dir(dir.path().join("markers"))
            .unwrap()
            .collect();
        assert!(leftover.is_empty());
    }
}
