/// Harness report: a JSON summary of one harness run.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Final classification of a harness run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessOutcome {
    /// Inspector ran and reported no leaks.
    Clean,
    /// Inspector reported at least one leak.
    Leaked,
    /// Inspector could not be run, or its output had no leak summary.
    InspectorFailed,
    /// The child exited without deleting the ready marker.
    ExitedWithoutHandshake,
    /// The ready marker was still present when the ready timeout expired.
    ReadyTimeout,
}

impl HarnessOutcome {
    /// Process exit code for the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            HarnessOutcome::Clean => 0,
            HarnessOutcome::Leaked => 1,
            _ => 2,
        }
    }
}

/// The JSON payload written to the report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessReport {
    pub command: Vec<String>,
    pub pid: u32,
    pub outcome: HarnessOutcome,
    pub leaks: Option<u64>,
    pub leaked_bytes: Option<u64>,
    pub inspector_exit_code: Option<i32>,
    pub child_exit_code: Option<i32>,
    /// True if the harness had to kill the child's process group.
    pub killed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Errors from writing the report file.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => {
                write!(f, "failed to serialize report: {}", source)
            }
            ReportError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            ReportError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}

/// Writes the report file.
pub struct ReportFile {
    path: PathBuf,
}

impl ReportFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write the report.
    ///
    /// Writes to a uniquely named temporary file in the same directory, then
    /// renames so readers never see a partial write. The temporary file is
    /// removed if the rename fails.
    pub fn write(&self, report: &HarnessReport) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| ReportError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".exit-handshake-report.")
            .tempfile_in(dir)
            .map_err(|e| ReportError::Write {
                path: dir.to_path_buf(),
                source: e,
            })?;

        tmp.write_all(json.as_bytes()).map_err(|e| ReportError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

        tmp.persist(&self.path).map_err(|e| ReportError::Rename {
            from: e.file.path().to_path_buf(),
            to: self.path.clone(),
            source: e.error,
        })?;

        tracing::debug!(path = %self.path.display(), "report written");
        Ok(())
    }
}
