//! Instance artifact access from async code
//!
//! [`InstanceStore`] does plain file I/O, so every call is moved onto the
//! blocking pool.

use rc_core::artifact::{InstanceRecord, InstanceStore};
use rc_core::{ArtifactError, InstanceName};

async fn blocking<T, F>(f: F) -> Result<T, ArtifactError>
where
    F: FnOnce() -> Result<T, ArtifactError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))?
}

/// Load the connection details of `name`
pub async fn load(store: &InstanceStore, name: &InstanceName) -> Result<InstanceRecord, ArtifactError> {
    let store = store.clone();
    let name = name.clone();
    blocking(move || store.load(&name)).await
}

/// Load the connection details of `name` together with its private key
pub async fn load_with_key(
    store: &InstanceStore,
    name: &InstanceName,
) -> Result<(InstanceRecord, String), ArtifactError> {
    let store = store.clone();
    let name = name.clone();
    blocking(move || {
        let record = store.load(&name)?;
        let key = record.read_private_key()?;
        Ok((record, key))
    })
    .await
}

/// Flip `onboarding_completed` on the artifact of `name`
pub async fn mark_onboarding_completed(
    store: &InstanceStore,
    name: &InstanceName,
    completed_at: String,
) -> Result<(), ArtifactError> {
    let store = store.clone();
    let name = name.clone();
    blocking(move || store.mark_onboarding_completed(&name, &completed_at)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_with_key_reads_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let instances = dir.path().join("instances");
        std::fs::create_dir_all(&instances).unwrap();
        std::fs::write(
            instances.join("alpha.yml"),
            "instances:\n  - ip: 10.0.0.5\n    ssh:\n      key_file: alpha_key\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("alpha_key"), "PRIVATE").unwrap();

        let store = InstanceStore::new(instances, dir.path());
        let name = InstanceName::new("alpha").unwrap();
        let (record, key) = load_with_key(&store, &name).await.unwrap();
        assert_eq!(record.ip, "10.0.0.5");
        assert_eq!(key, "PRIVATE");

        let missing = InstanceName::new("beta").unwrap();
        assert!(matches!(
            load(&store, &missing).await,
            Err(ArtifactError::NotFound(_))
        ));
    }
}
