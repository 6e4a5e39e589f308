//! rc-orchestrator: The roboclaw-deploy dashboard backend
//!
//! Provisions cloud servers and installs the agent runtime on them, streaming
//! progress to the browser. Once an instance exists, the dashboard opens a web
//! terminal on it through SSH tunnels for onboarding, and starts or stops the
//! agent gateway service.

pub mod artifact;
pub mod cloud;
pub mod deploy;
pub mod http;
pub mod keygen;
pub mod onboarding;
pub mod remote;
pub mod service;
pub mod state;
pub mod tunnel;

pub use state::{AppState, Backends};
