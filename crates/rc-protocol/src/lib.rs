//! rc-protocol: Event stream protocol for roboclaw-deploy
//!
//! This crate defines the events streamed from a running deployment to the
//! dashboard client, the fixed provisioning phases, and the tracker that keeps
//! phase and progress updates monotonic.

pub mod error;
pub mod event;
pub mod phase;

pub use error::ProtocolError;
pub use event::{
    DeployEvent, DeployFailure, DeployResult, Heartbeat, LogEntry, LogLevel, PhaseUpdate,
    ProgressUpdate,
};
pub use phase::{Phase, PhaseTracker, TOTAL_STEPS};
