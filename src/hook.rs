use crate::config::HandshakeConfig;
use crate::handshake::{CancelToken, Handshake, HandshakeOutcome};

/// Runs the exit handshake when dropped.
///
/// Bind it at the top of `main` so it drops as `main` returns:
///
/// ```no_run
/// let _guard = exit_handshake::ExitGuard::install();
/// // ... program body ...
/// ```
///
/// `std::process::exit` skips destructors; call [`ExitGuard::finish`]
/// before exiting explicitly.
#[derive(Debug)]
pub struct ExitGuard {
    handshake: Option<Handshake>,
}

impl ExitGuard {
    /// Read the handshake configuration from the environment and arm a guard.
    pub fn install() -> Self {
        Self::new(HandshakeConfig::from_env())
    }

    pub fn new(config: HandshakeConfig) -> Self {
        tracing::debug!(
            enabled = config.enabled,
            ready = ?config.ready_file,
            done = ?config.done_file,
            "exit handshake armed"
        );
        Self {
            handshake: Some(Handshake::new(config)),
        }
    }

    /// Token that aborts the wait for the done marker, e.g. from a signal handler.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.handshake.as_ref().map(Handshake::cancel_token)
    }

    /// Whether the guard is armed with the handshake feature flag on.
    pub fn is_enabled(&self) -> bool {
        self.handshake.as_ref().is_some_and(|h| h.config().enabled)
    }

    /// Whether the handshake will still run.
    pub fn is_armed(&self) -> bool {
        self.handshake.is_some()
    }

    /// Drop the guard without running the handshake.
    pub fn disarm(&mut self) {
        if self.handshake.take().is_some() {
            tracing::debug!("exit handshake disarmed");
        }
    }

    /// Run the handshake now instead of at drop.
    ///
    /// Returns `None` if the guard was already disarmed.
    pub fn finish(mut self) -> Option<HandshakeOutcome> {
        self.handshake.take().map(|mut h| h.perform())
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(mut handshake) = self.handshake.take() {
            let outcome = handshake.perform();
            tracing::debug!(?outcome, "exit handshake finished");
        }
    }
}
