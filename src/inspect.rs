/// Inspector invocation and leak-summary parsing.
///
/// Recognises summary lines like:
/// - macOS `leaks`: `Process 4242: 3 leaks for 1024 total leaked bytes.`
/// - valgrind: `definitely lost: 1,024 bytes in 3 blocks`
/// - valgrind, clean run: `All heap blocks were freed -- no leaks are possible`
use crate::config::InspectorConfig;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;

static LEAKS_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)Process\s+\d+:\s+([\d,]+)\s+leaks?\s+for\s+([\d,]+)\s+total\s+leaked\s+bytes",
    )
    .unwrap()
});

static VALGRIND_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)definitely\s+lost:\s+([\d,]+)\s+bytes\s+in\s+([\d,]+)\s+blocks").unwrap()
});

static VALGRIND_CLEAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)All\s+heap\s+blocks\s+were\s+freed\s+--\s+no\s+leaks\s+are\s+possible")
        .unwrap()
});

/// Leak counts extracted from inspector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakSummary {
    pub leaks: u64,
    pub bytes: u64,
}

impl LeakSummary {
    pub fn is_clean(&self) -> bool {
        self.leaks == 0 && self.bytes == 0
    }
}

/// Captured result of one inspector run.
#[derive(Debug, Clone)]
pub struct InspectorOutput {
    /// None if the inspector was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl InspectorOutput {
    /// Parse a leak summary from stdout, falling back to stderr.
    pub fn summary(&self) -> Option<LeakSummary> {
        parse_leak_summary(&self.stdout).or_else(|| parse_leak_summary(&self.stderr))
    }
}

/// Errors that can occur while running the inspector.
#[derive(Debug)]
pub enum InspectError {
    /// The configured command was empty.
    NoCommand,
    /// Failed to spawn or wait on the inspector.
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for InspectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InspectError::NoCommand => write!(f, "no inspector command configured"),
            InspectError::Spawn { command, source } => {
                write!(f, "failed to run inspector {}: {}", command, source)
            }
        }
    }
}

impl std::error::Error for InspectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InspectError::NoCommand => None,
            InspectError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Build the inspector arguments, replacing `{pid}` with the target pid.
pub fn build_args(config: &InspectorConfig, pid: u32) -> Vec<String> {
    let pid = pid.to_string();
    config
        .args
        .iter()
        .map(|arg| arg.replace("{pid}", &pid))
        .collect()
}

/// Run the inspector against `pid` and capture its output.
pub async fn run_inspector(
    config: &InspectorConfig,
    pid: u32,
) -> Result<InspectorOutput, InspectError> {
    if config.command.trim().is_empty() {
        return Err(InspectError::NoCommand);
    }

    let args = build_args(config, pid);
    tracing::info!(command = %config.command, args = ?args, pid, "running inspector");

    let output = Command::new(&config.command)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| InspectError::Spawn {
            command: config.command.clone(),
            source: e,
        })?;

    let result = InspectorOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::info!(
        exit_code = ?result.exit_code,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        "inspector finished"
    );
    Ok(result)
}

/// Find the earliest leak summary line in `text`, whichever tool printed it.
pub fn parse_leak_summary(text: &str) -> Option<LeakSummary> {
    let leaks_tool = LEAKS_SUMMARY.captures(text).and_then(|caps| {
        let summary = LeakSummary {
            leaks: parse_count(&caps[1])?,
            bytes: parse_count(&caps[2])?,
        };
        Some((caps.get(0)?.start(), summary))
    });
    let valgrind = VALGRIND_SUMMARY.captures(text).and_then(|caps| {
        let summary = LeakSummary {
            leaks: parse_count(&caps[2])?,
            bytes: parse_count(&caps[1])?,
        };
        Some((caps.get(0)?.start(), summary))
    });
    let valgrind_clean = VALGRIND_CLEAN
        .find(text)
        .map(|m| (m.start(), LeakSummary { leaks: 0, bytes: 0 }));

    let earliest = [leaks_tool, valgrind, valgrind_clean]
        .into_iter()
        .flatten()
        .min_by_key(|(start, _)| *start)
        .map(|(_, summary)| summary);
    if earliest.is_none() {
        tracing::debug!("no leak summary found in inspector output");
    }
    earliest
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.replace(',', "").parse().ok()
}
