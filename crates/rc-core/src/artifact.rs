//! Instance artifact store
//!
//! Every provisioned machine is described by `instances/<name>.yml`, written
//! by the provisioning tooling. The file holds an `instances` list whose first
//! element describes the machine:
//!
//! ```yaml
//! instances:
//!   - name: alpha
//!     ip: 203.0.113.7
//!     ssh:
//!       key_file: ssh-keys/alpha_key
//!       public_key_file: ssh-keys/alpha_key.pub
//!     onboarding_completed: false
//! ```
//!
//! The dashboard only reads the connection details and flips
//! `onboarding_completed`. Every other field is owned by the tooling and is
//! preserved on write, which is why updates go through [`serde_yaml::Value`]
//! instead of a typed struct.

use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;
use crate::types::InstanceName;

/// Connection details of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: InstanceName,
    pub ip: String,
    /// Private key path, already resolved against the project root
    pub key_path: PathBuf,
    pub public_key_path: Option<PathBuf>,
    pub onboarding_completed: bool,
}

impl InstanceRecord {
    /// Read the private key this instance is reached with
    pub fn read_private_key(&self) -> Result<String, ArtifactError> {
        Ok(std::fs::read_to_string(&self.key_path)?)
    }
}

/// Reads and updates instance artifacts
#[derive(Debug, Clone)]
pub struct InstanceStore {
    instances_dir: PathBuf,
    project_root: PathBuf,
}

impl InstanceStore {
    /// Create a store over `instances_dir`; relative key paths resolve
    /// against `project_root`
    pub fn new(instances_dir: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            instances_dir: instances_dir.into(),
            project_root: project_root.into(),
        }
    }

    /// Path of the artifact for `name`
    pub fn artifact_path(&self, name: &InstanceName) -> PathBuf {
        self.instances_dir.join(format!("{}.yml", name))
    }

    /// Load the connection details of `name`
    pub fn load(&self, name: &InstanceName) -> Result<InstanceRecord, ArtifactError> {
        let path = self.artifact_path(name);
        let doc = self.read_document(name, &path)?;
        let instance = first_instance(&doc).ok_or_else(|| ArtifactError::Malformed {
            path: path.clone(),
            message: "no entries under `instances`".to_string(),
        })?;

        let ip = instance
            .get("ip")
            .and_then(Value::as_str)
            .filter(|ip| !ip.trim().is_empty())
            .ok_or_else(|| missing(name, "ip"))?
            .trim()
            .to_string();

        let ssh = instance.get("ssh");
        let key_file = ssh
            .and_then(|s| s.get("key_file"))
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| missing(name, "ssh.key_file"))?;
        let public_key_path = ssh
            .and_then(|s| s.get("public_key_file"))
            .and_then(Value::as_str)
            .map(|p| self.resolve(p));

        let onboarding_completed = instance
            .get("onboarding_completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(InstanceRecord {
            name: name.clone(),
            ip,
            key_path: self.resolve(key_file),
            public_key_path,
            onboarding_completed,
        })
    }

    /// Record that onboarding finished, keeping every other field intact
    pub fn mark_onboarding_completed(
        &self,
        name: &InstanceName,
        completed_at: &str,
    ) -> Result<(), ArtifactError> {
        let path = self.artifact_path(name);
        let mut doc = self.read_document(name, &path)?;

        let instance = doc
            .get_mut("instances")
            .and_then(Value::as_sequence_mut)
            .and_then(|list| list.first_mut())
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| ArtifactError::Malformed {
                path: path.clone(),
                message: "no entries under `instances`".to_string(),
            })?;
        set(instance, "onboarding_completed", Value::Bool(true));
        set(
            instance,
            "onboarding_completed_at",
            Value::String(completed_at.to_string()),
        );

        let content = serde_yaml::to_string(&doc)?;
        write_replace(&path, &content)?;
        tracing::info!("Marked onboarding completed for {}", name);
        Ok(())
    }

    fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    fn read_document(&self, name: &InstanceName, path: &Path) -> Result<Value, ArtifactError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&content).map_err(|e| ArtifactError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

fn first_instance(doc: &Value) -> Option<&Value> {
    doc.get("instances")?.as_sequence()?.first()
}

fn missing(name: &InstanceName, field: &'static str) -> ArtifactError {
    ArtifactError::MissingField {
        name: name.to_string(),
        field,
    }
}

fn set(map: &mut Mapping, key: &str, value: Value) {
    map.insert(Value::String(key.to_string()), value);
}

/// Write through a sibling temp file so readers never see a partial artifact
fn write_replace(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("yml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT: &str = r#"
instances:
  - name: alpha
    ip: 203.0.113.7
    server_type: cax11
    software:
      docker: "27.1"
      nodejs: "22"
    ssh:
      key_file: ssh-keys/alpha_key
      public_key_file: /abs/alpha_key.pub
    onboarding_completed: false
"#;

    fn store_with(content: &str) -> (tempfile::TempDir, InstanceStore, InstanceName) {
        let dir = tempfile::tempdir().unwrap();
        let instances = dir.path().join("instances");
        std::fs::create_dir_all(&instances).unwrap();
        std::fs::write(instances.join("alpha.yml"), content).unwrap();
        let store = InstanceStore::new(instances, dir.path());
        (dir, store, InstanceName::new("alpha").unwrap())
    }

    #[test]
    fn test_load_resolves_relative_key_path() {
        let (dir, store, name) = store_with(ARTIFACT);
        let record = store.load(&name).unwrap();

        assert_eq!(record.ip, "203.0.113.7");
        assert_eq!(record.key_path, dir.path().join("ssh-keys/alpha_key"));
        assert_eq!(
            record.public_key_path,
            Some(PathBuf::from("/abs/alpha_key.pub"))
        );
        assert!(!record.onboarding_completed);
    }

    #[test]
    fn test_missing_instance() {
        let (_dir, store, _) = store_with(ARTIFACT);
        let other = InstanceName::new("beta").unwrap();
        assert!(matches!(store.load(&other), Err(ArtifactError::NotFound(_))));
    }

    #[test]
    fn test_missing_key_file() {
        let (_dir, store, name) = store_with("instances:\n  - ip: 10.0.0.1\n");
        assert!(matches!(
            store.load(&name),
            Err(ArtifactError::MissingField { field: "ssh.key_file", .. })
        ));
    }

    #[test]
    fn test_empty_instances_is_malformed() {
        let (_dir, store, name) = store_with("instances: []\n");
        assert!(matches!(
            store.load(&name),
            Err(ArtifactError::Malformed { .. })
        ));
    }

    #[test]
    fn test_mark_completed_preserves_other_fields() {
        let (_dir, store, name) = store_with(ARTIFACT);
        store
            .mark_onboarding_completed(&name, "2026-03-01T12:00:00.000Z")
            .unwrap();

        let record = store.load(&name).unwrap();
        assert!(record.onboarding_completed);

        let raw = std::fs::read_to_string(store.artifact_path(&name)).unwrap();
        let doc: Value = serde_yaml::from_str(&raw).unwrap();
        let instance = &doc["instances"][0];
        assert_eq!(instance["server_type"].as_str(), Some("cax11"));
        assert_eq!(instance["software"]["docker"].as_str(), Some("27.1"));
        assert_eq!(
            instance["onboarding_completed_at"].as_str(),
            Some("2026-03-01T12:00:00.000Z")
        );
    }
}
