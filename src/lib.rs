//! Exit-time handshake between a monitored process and an inspection harness.
//!
//! The monitored process installs an [`ExitGuard`]; the harness side lives in
//! [`harness`].

pub mod config;
pub mod handshake;
pub mod harness;
pub mod hook;
pub mod inspect;
pub mod report;

pub use config::{HandshakeConfig, HarnessConfig};
pub use handshake::{CancelToken, Handshake, HandshakeOutcome, HandshakeState};
pub use hook::ExitGuard;
pub use report::{HarnessOutcome, HarnessReport};
