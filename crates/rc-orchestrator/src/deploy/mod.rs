//! Deployment orchestration
//!
//! A deployment takes a fresh cloud server through twelve fixed phases and
//! reports every step as a [`DeployEvent`](rc_protocol::DeployEvent) stream.
//! [`Orchestrator`] drives the phases itself over the cloud API and SSH;
//! [`ScriptDeployment`] delegates the work to the external provisioning
//! script and only interprets its output.

pub mod commands;
mod emitter;
mod error;
mod orchestrator;
mod pipeline;
mod script;

pub use emitter::{EventSink, HeartbeatHandle, Transcript};
pub use error::DeployError;
pub use orchestrator::{DeployMode, DeployRequest, DeployTarget, DeploymentState, Orchestrator};
pub use pipeline::{run_phases, PhaseDescriptor, PhaseFailure, PhaseFn, PhaseFuture};
pub use script::{classify, detect_phase, extract_ip, ScriptDeployment};
