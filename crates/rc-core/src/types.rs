//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RcError;

/// Name of a provisioned instance
///
/// Instance names end up in file paths (`instances/<name>.yml`) and in remote
/// shell commands, so only ASCII letters, digits, `.`, `_` and `-` are
/// accepted, and the name may not start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceName(String);

impl InstanceName {
    /// Longest accepted name (matches the provider's server name limit)
    pub const MAX_LEN: usize = 63;

    /// Validate and wrap an instance name
    pub fn new(name: impl Into<String>) -> Result<Self, RcError> {
        let name = name.into();
        if name.is_empty() || name.len() > Self::MAX_LEN {
            return Err(RcError::InvalidInput(format!(
                "instance name must be 1-{} characters",
                Self::MAX_LEN
            )));
        }
        if name.starts_with('.') {
            return Err(RcError::InvalidInput(format!(
                "instance name may not start with '.': {}",
                name
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(RcError::InvalidInput(format!(
                "invalid character {:?} in instance name",
                c
            )));
        }
        Ok(Self(name))
    }

    /// Get the raw name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceName {
    type Err = RcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for InstanceName {
    type Error = RcError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<InstanceName> for String {
    fn from(name: InstanceName) -> Self {
        name.0
    }
}

/// Logical key of a tunnel: the instance name, optionally with a purpose
///
/// Displays as `name` or `name:purpose`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    instance: InstanceName,
    purpose: Option<String>,
}

impl TunnelKey {
    /// Primary tunnel of an instance
    pub fn primary(instance: InstanceName) -> Self {
        Self {
            instance,
            purpose: None,
        }
    }

    /// Secondary tunnel with a purpose suffix
    pub fn with_purpose(instance: InstanceName, purpose: impl Into<String>) -> Self {
        Self {
            instance,
            purpose: Some(purpose.into()),
        }
    }

    /// Instance this tunnel belongs to
    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// Purpose suffix, if any
    pub fn purpose(&self) -> Option<&str> {
        self.purpose.as_deref()
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.purpose {
            Some(purpose) => write!(f, "{}:{}", self.instance, purpose),
            None => write!(f, "{}", self.instance),
        }
    }
}

impl From<InstanceName> for TunnelKey {
    fn from(instance: InstanceName) -> Self {
        Self::primary(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name_accepts_generated_names() {
        let name = InstanceName::new("roboclaw-lq3k9z2a").unwrap();
        assert_eq!(name.as_str(), "roboclaw-lq3k9z2a");
        assert!(InstanceName::new("finland_01.prod").is_ok());
    }

    #[test]
    fn test_instance_name_rejects_paths_and_shell() {
        for bad in ["", "../etc/passwd", "a/b", ".hidden", "x; rm -rf /", "name$(id)", "sp ace"] {
            assert!(InstanceName::new(bad).is_err(), "accepted {:?}", bad);
        }
        assert!(InstanceName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_instance_name_deserialize_validates() {
        assert!(serde_json::from_str::<InstanceName>("\"ok-name\"").is_ok());
        assert!(serde_json::from_str::<InstanceName>("\"../bad\"").is_err());
    }

    #[test]
    fn test_tunnel_key_display() {
        let name = InstanceName::new("alpha").unwrap();
        assert_eq!(TunnelKey::primary(name.clone()).to_string(), "alpha");
        assert_eq!(
            TunnelKey::with_purpose(name, "gateway").to_string(),
            "alpha:gateway"
        );
    }
}
