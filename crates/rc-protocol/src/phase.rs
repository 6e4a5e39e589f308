//! Provisioning phases
//!
//! A deployment walks through twelve fixed phases. Each phase has a stable
//! wire identifier, a step number and a human readable label. Step numbers
//! only ever move forward within a single deployment; [`PhaseTracker`]
//! enforces that for every source of phase signals.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::event::{PhaseUpdate, ProgressUpdate};

/// Number of phases in a deployment
pub const TOTAL_STEPS: u8 = 12;

/// One ordered step of the provisioning pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Generate the SSH key pair
    #[serde(rename = "keygen")]
    Keygen,
    /// Register the public key with the cloud provider
    #[serde(rename = "ssh_key")]
    SshKey,
    /// Create the server and wait until it is running
    #[serde(rename = "provisioning")]
    Provisioning,
    /// Wait for the SSH port to accept connections
    #[serde(rename = "ssh_wait")]
    SshWait,
    /// Install base packages
    #[serde(rename = "install_packages")]
    InstallPackages,
    /// Create the service user
    #[serde(rename = "create_user")]
    CreateUser,
    /// Install Docker CE
    #[serde(rename = "install_docker")]
    InstallDocker,
    /// Configure the firewall
    #[serde(rename = "configure_firewall")]
    ConfigureFirewall,
    /// Install the Node.js runtime
    #[serde(rename = "install_nodejs")]
    InstallRuntime,
    /// Install the agent application
    #[serde(rename = "install_roboclaw")]
    InstallApplication,
    /// Verify the installation
    #[serde(rename = "verify")]
    Verify,
    /// Deployment finished
    #[serde(rename = "success")]
    Success,
}

impl Phase {
    /// All phases in pipeline order
    pub const ALL: [Phase; TOTAL_STEPS as usize] = [
        Phase::Keygen,
        Phase::SshKey,
        Phase::Provisioning,
        Phase::SshWait,
        Phase::InstallPackages,
        Phase::CreateUser,
        Phase::InstallDocker,
        Phase::ConfigureFirewall,
        Phase::InstallRuntime,
        Phase::InstallApplication,
        Phase::Verify,
        Phase::Success,
    ];

    /// Step number (1-based)
    pub fn step(self) -> u8 {
        match self {
            Phase::Keygen => 1,
            Phase::SshKey => 2,
            Phase::Provisioning => 3,
            Phase::SshWait => 4,
            Phase::InstallPackages => 5,
            Phase::CreateUser => 6,
            Phase::InstallDocker => 7,
            Phase::ConfigureFirewall => 8,
            Phase::InstallRuntime => 9,
            Phase::InstallApplication => 10,
            Phase::Verify => 11,
            Phase::Success => 12,
        }
    }

    /// Human readable label
    pub fn label(self) -> &'static str {
        match self {
            Phase::Keygen => "Generating SSH keypair",
            Phase::SshKey => "Uploading SSH key to Hetzner",
            Phase::Provisioning => "Creating VPS instance",
            Phase::SshWait => "Waiting for SSH",
            Phase::InstallPackages => "Installing base packages",
            Phase::CreateUser => "Creating roboclaw user",
            Phase::InstallDocker => "Installing Docker",
            Phase::ConfigureFirewall => "Configuring firewall",
            Phase::InstallRuntime => "Installing Node.js",
            Phase::InstallApplication => "Installing RoboClaw",
            Phase::Verify => "Verifying installation",
            Phase::Success => "Complete",
        }
    }

    /// Stable wire identifier
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Keygen => "keygen",
            Phase::SshKey => "ssh_key",
            Phase::Provisioning => "provisioning",
            Phase::SshWait => "ssh_wait",
            Phase::InstallPackages => "install_packages",
            Phase::CreateUser => "create_user",
            Phase::InstallDocker => "install_docker",
            Phase::ConfigureFirewall => "configure_firewall",
            Phase::InstallRuntime => "install_nodejs",
            Phase::InstallApplication => "install_roboclaw",
            Phase::Verify => "verify",
            Phase::Success => "success",
        }
    }

    /// Look up a phase by its step number
    pub fn from_step(step: u8) -> Result<Phase, ProtocolError> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.step() == step)
            .ok_or(ProtocolError::InvalidStep(step))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownPhase(s.to_string()))
    }
}

/// Keeps phase and progress updates monotonic within one deployment.
///
/// A phase update is produced only when its step is strictly greater than
/// the last one produced; progress only when the percentage grows.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    current: Option<Phase>,
    percent: u8,
}

impl PhaseTracker {
    /// Create a tracker that has not seen any phase yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently accepted phase
    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    /// Last accepted progress value
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Accept `phase` if it moves the pipeline forward
    pub fn advance(&mut self, phase: Phase) -> Option<PhaseUpdate> {
        let last = self.current.map(Phase::step).unwrap_or(0);
        if phase.step() <= last {
            return None;
        }
        self.current = Some(phase);
        Some(PhaseUpdate::from(phase))
    }

    /// Accept `percent` (clamped to 100) if it is above the last value
    pub fn progress(&mut self, percent: u8) -> Option<ProgressUpdate> {
        let percent = percent.min(100);
        if percent <= self.percent {
            return None;
        }
        self.percent = percent;
        Some(ProgressUpdate { percent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_sequential() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.step() as usize, i + 1);
        }
        assert_eq!(Phase::ALL.len(), TOTAL_STEPS as usize);
    }

    #[test]
    fn test_wire_ids_roundtrip_through_from_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
        }
        assert!("compile_kernel".parse::<Phase>().is_err());
    }

    #[test]
    fn test_from_step() {
        assert_eq!(Phase::from_step(9).unwrap(), Phase::InstallRuntime);
        assert!(matches!(Phase::from_step(0), Err(ProtocolError::InvalidStep(0))));
        assert!(Phase::from_step(13).is_err());
    }

    #[test]
    fn test_tracker_suppresses_repeats_and_regressions() {
        let mut tracker = PhaseTracker::new();

        assert!(tracker.advance(Phase::Keygen).is_some());
        assert!(tracker.advance(Phase::Keygen).is_none());
        assert!(tracker.advance(Phase::InstallDocker).is_some());
        // Noisy output mentioning an earlier task must not move us back
        assert!(tracker.advance(Phase::CreateUser).is_none());
        assert!(tracker.advance(Phase::InstallDocker).is_none());

        let update = tracker.advance(Phase::Verify).unwrap();
        assert_eq!(update.step, 11);
        assert_eq!(update.total_steps, TOTAL_STEPS);
        assert_eq!(tracker.current(), Some(Phase::Verify));
    }

    #[test]
    fn test_tracker_progress_is_monotonic() {
        let mut tracker = PhaseTracker::new();

        assert_eq!(tracker.progress(5).unwrap().percent, 5);
        assert!(tracker.progress(5).is_none());
        assert!(tracker.progress(3).is_none());
        assert_eq!(tracker.progress(250).unwrap().percent, 100);
        assert_eq!(tracker.percent(), 100);
    }
}
