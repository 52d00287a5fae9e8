/// Exit-time handshake with an external inspection harness.
///
/// The harness creates a ready marker and a done marker, then launches the
/// monitored process. At exit the process deletes the ready marker (telling
/// the harness it is parked and can be inspected) and blocks until the
/// harness deletes the done marker.
use crate::config::HandshakeConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Where the handshake currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitConfig,
    DeleteReady,
    PollDone,
    Complete,
}

/// How a handshake ended. None of these are fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The feature flag is off; nothing was touched.
    Disabled,
    /// A marker path is not configured, so no harness is attached.
    NoHarness,
    /// The ready marker could not be deleted; no polling happened.
    ReadyDeleteFailed { path: PathBuf, error: String },
    /// The done marker disappeared after `polls` checks that saw it present.
    Completed { polls: u32 },
    /// Checking the done marker failed for a reason other than "not found".
    /// Treated as done.
    DoneCheckFailed {
        path: PathBuf,
        error: String,
        polls: u32,
    },
    /// `max_wait` elapsed with the done marker still present.
    TimedOut { polls: u32 },
    /// The cancel token was set while waiting.
    Cancelled { polls: u32 },
}

/// Shared flag that stops a waiting handshake at its next poll.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A single run of the handshake.
///
/// Runs at most once: calling [`Handshake::perform`] again after it has
/// reached `Complete` returns the recorded outcome without touching the
/// filesystem.
#[derive(Debug)]
pub struct Handshake {
    config: HandshakeConfig,
    cancel: CancelToken,
    state: HandshakeState,
    outcome: Option<HandshakeOutcome>,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            state: HandshakeState::Init,
            outcome: None,
        }
    }

    /// Use an externally owned cancel token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Run the handshake to completion, blocking while the done marker exists.
    pub fn perform(&mut self) -> HandshakeOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = self.run();
        self.state = HandshakeState::Complete;
        self.outcome = Some(outcome.clone());
        outcome
    }

    fn run(&mut self) -> HandshakeOutcome {
        if !self.config.enabled {
            tracing::info!("linked in leak check skipped");
            return HandshakeOutcome::Disabled;
        }

        tracing::debug!("checking for leak check harness");
        self.state = HandshakeState::AwaitConfig;
        let (Some(ready), Some(done)) = (
            self.config.ready_file.clone(),
            self.config.done_file.clone(),
        ) else {
            return HandshakeOutcome::NoHarness;
        };

        self.state = HandshakeState::DeleteReady;
        // A cancelled hook must not invite inspection.
        if self.cancel.is_cancelled() {
            tracing::warn!("leak check cancelled before signalling ready");
            return HandshakeOutcome::Cancelled { polls: 0 };
        }
        if let Err(e) = std::fs::remove_file(&ready) {
            tracing::error!(
                path = %ready.display(),
                error = %e,
                "could not delete ready file"
            );
            return HandshakeOutcome::ReadyDeleteFailed {
                path: ready,
                error: e.to_string(),
            };
        }
        tracing::debug!(path = %ready.display(), "ready file deleted");

        self.state = HandshakeState::PollDone;
        self.poll_done(&done)
    }

    fn poll_done(&self, done: &Path) -> HandshakeOutcome {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                tracing::warn!(polls, "leak check wait cancelled");
                return HandshakeOutcome::Cancelled { polls };
            }

            match std::fs::metadata(done) {
                Ok(_) => {
                    polls += 1;
                    tracing::info!(
                        path = %done.display(),
                        "waiting for done file to be deleted..."
                    );
                    if let Some(max_wait) = self.config.max_wait {
                        if start.elapsed() >= max_wait {
                            tracing::warn!(
                                path = %done.display(),
                                waited_ms = start.elapsed().as_millis() as u64,
                                "gave up waiting for done file"
                            );
                            return HandshakeOutcome::TimedOut { polls };
                        }
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::info!(polls, "leak check performed");
                    return HandshakeOutcome::Completed { polls };
                }
                Err(e) => {
                    tracing::warn!(
                        path = %done.display(),
                        error = %e,
                        "failed to access done file"
                    );
                    tracing::info!(polls, "leak check performed");
                    return HandshakeOutcome::DoneCheckFailed {
                        path: done.to_path_buf(),
                        error: e.to_string(),
                        polls,
                    };
                }
            }
        }
    }
}

/// Run a one-off handshake with the given configuration.
pub fn perform(config: &HandshakeConfig) -> HandshakeOutcome {
    Handshake::new(config.clone()).perform()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn markers(dir: &TempDir) -> (PathBuf, PathBuf) {
        let ready = dir.path().join("ready");
        let done = dir.path().join("done");
        std::fs::write(&ready, b"").unwrap();
        std::fs::write(&done, b"").unwrap();
        (ready, done)
    }

    fn enabled_config(ready: &Path, done: &Path) -> HandshakeConfig {
        HandshakeConfig::default()
            .with_enabled(true)
            .with_markers(ready, done)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn disabled_flag_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        let config = HandshakeConfig::default().with_markers(&ready, &done);

        let mut handshake = Handshake::new(config);
        assert_eq!(handshake.perform(), HandshakeOutcome::Disabled);
        assert_eq!(handshake.state(), HandshakeState::Complete);
        assert!(ready.exists());
        assert!(done.exists());
    }

    #[test]
    fn missing_ready_path_skips_silently() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        let mut config = enabled_config(&ready, &done);
        config.ready_file = None;

        assert_eq!(perform(&config), HandshakeOutcome::NoHarness);
        assert!(ready.exists());
        assert!(done.exists());
    }

    #[test]
    fn missing_done_path_skips_without_deleting_ready() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        let mut config = enabled_config(&ready, &done);
        config.done_file = None;

        assert_eq!(perform(&config), HandshakeOutcome::NoHarness);
        assert!(ready.exists());
    }

    #[test]
    fn missing_ready_file_aborts_before_polling() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        std::fs::remove_file(&ready).unwrap();

        let outcome = perform(&enabled_config(&ready, &done));
        match outcome {
            HandshakeOutcome::ReadyDeleteFailed { path, error } => {
                assert_eq!(path, ready);
                assert!(!error.is_empty());
            }
            other => panic!("expected ReadyDeleteFailed, got {other:?}"),
        }
        // The done marker is never touched, and we returned without blocking on it.
        assert!(done.exists());
    }

    #[test]
    fn completes_immediately_when_done_already_gone() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        std::fs::remove_file(&done).unwrap();

        let outcome = perform(&enabled_config(&ready, &done));
        assert_eq!(outcome, HandshakeOutcome::Completed { polls: 0 });
        assert!(!ready.exists());
    }

    #[test]
    fn waits_until_done_is_removed_externally() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);

        let remover = {
            let done = done.clone();
            let ready = ready.clone();
            std::thread::spawn(move || {
                // Wait for the hook to signal readiness, then finish "inspecting".
                while ready.exists() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                std::thread::sleep(Duration::from_millis(100));
                std::fs::remove_file(&done).unwrap();
            })
        };

        let started = Instant::now();
        let outcome = perform(&enabled_config(&ready, &done));
        remover.join().unwrap();

        match outcome {
            HandshakeOutcome::Completed { polls } => assert!(polls >= 2, "polls = {polls}"),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!ready.exists());
        assert!(!done.exists());
    }

    #[test]
    fn rerun_after_markers_gone_does_not_hang() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        std::fs::remove_file(&done).unwrap();
        let config = enabled_config(&ready, &done);

        assert_eq!(perform(&config), HandshakeOutcome::Completed { polls: 0 });
        assert!(matches!(
            perform(&config),
            HandshakeOutcome::ReadyDeleteFailed { .. }
        ));
    }

    #[test]
    fn perform_twice_on_same_handshake_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        std::fs::remove_file(&done).unwrap();

        let mut handshake = Handshake::new(enabled_config(&ready, &done));
        assert_eq!(handshake.state(), HandshakeState::Init);
        let first = handshake.perform();
        // Recreate the ready marker: a second perform must not delete it again.
        std::fs::write(&ready, b"").unwrap();
        assert_eq!(handshake.perform(), first);
        assert!(ready.exists());
    }

    #[test]
    fn max_wait_bounds_the_poll_loop() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        let config = enabled_config(&ready, &done).with_max_wait(Some(Duration::from_millis(50)));

        let outcome = perform(&config);
        match outcome {
            HandshakeOutcome::TimedOut { polls } => assert!(polls >= 1),
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(!ready.exists());
        // The done marker belongs to the harness and is left in place.
        assert!(done.exists());
    }

    #[test]
    fn cancel_token_stops_waiting() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        let mut handshake = Handshake::new(enabled_config(&ready, &done));
        let token = handshake.cancel_token();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        let outcome = handshake.perform();
        canceller.join().unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Cancelled { .. }));
        assert!(done.exists());
    }

    #[test]
    fn pre_cancelled_token_leaves_ready_marker() {
        let dir = TempDir::new().unwrap();
        let (ready, done) = markers(&dir);
        let token = CancelToken::new();
        token.cancel();

        let outcome = Handshake::new(enabled_config(&ready, &done))
            .with_cancel(token)
            .perform();
        assert_eq!(outcome, HandshakeOutcome::Cancelled { polls: 0 });
        assert!(ready.exists());
        assert!(done.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unexpected_done_check_error_counts_as_done() {
        let dir = TempDir::new().unwrap();
        let (ready, _) = markers(&dir);
        // A path through a regular file fails with ENOTDIR, not ENOENT.
        let done = ready.with_file_name("not-a-dir").join("done");
        std::fs::write(ready.with_file_name("not-a-dir"), b"").unwrap();

        let outcome = perform(&enabled_config(&ready, &done));
        match outcome {
            HandshakeOutcome::DoneCheckFailed { path, polls, .. } => {
                assert_eq!(path, done);
                assert_eq!(polls, 0);
            }
            other => panic!("expected DoneCheckFailed, got {other:?}"),
        }
    }
}
