//! In-memory holder for the active policy, with optional write-through to
//! a local file so a restarted daemon picks up the last applied document.

use super::PolicyDocument;
use crate::error::{Error, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::info;

pub struct PolicyStore {
    policy: RwLock<PolicyDocument>,
    file_path: Option<PathBuf>,
}

impl PolicyStore {
    /// Create a store, restoring from `file_path` when it holds a parseable
    /// document with a default action. Any read or parse error falls back
    /// to the default-ACCEPT empty document.
    pub fn new(file_path: Option<PathBuf>) -> Self {
        let mut policy = PolicyDocument::default_accept();
        if let Some(ref path) = file_path {
            if let Ok(raw) = fs::read(path) {
                if let Ok(doc) = serde_json::from_slice::<PolicyDocument>(&raw) {
                    if !doc.default_action.trim().is_empty() {
                        info!("restored policy from {}", path.display());
                        policy = doc;
                    }
                }
            }
        }
        Self {
            policy: RwLock::new(policy),
            file_path,
        }
    }

    /// Snapshot of the current policy. Callers iterate the copy without
    /// holding the lock.
    pub fn get(&self) -> PolicyDocument {
        self.policy.read().expect("policy lock poisoned").clone()
    }

    /// Replace the current policy. The in-memory document is swapped first;
    /// persistence is best-effort and its failure surfaces to the caller
    /// after the swap.
    pub fn set(&self, doc: PolicyDocument) -> Result<()> {
        let doc = doc.normalized();
        {
            let mut guard = self.policy.write().expect("policy lock poisoned");
            *guard = doc.clone();
        }

        let Some(ref path) = self.file_path else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(&doc)?;
        persist(path, &data).map_err(Error::PersistenceError)
    }
}

#[cfg(unix)]
fn persist(path: &PathBuf, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, data)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn persist(path: &PathBuf, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::WorkloadPolicy;

    #[test]
    fn test_defaults_without_file() {
        let store = PolicyStore::new(None);
        let doc = store.get();
        assert_eq!(doc.default_action, "ACCEPT");
        assert!(doc.workloads.is_empty());
    }

    #[test]
    fn test_set_normalizes() {
        let store = PolicyStore::new(None);
        store.set(PolicyDocument::default()).unwrap();
        assert_eq!(store.get().default_action, "ACCEPT");
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");

        let store = PolicyStore::new(Some(path.clone()));
        store
            .set(PolicyDocument {
                default_action: "DROP".to_string(),
                workloads: vec![WorkloadPolicy {
                    namespace: "default".to_string(),
                    name: "web".to_string(),
                    ..Default::default()
                }],
            })
            .unwrap();

        let restored = PolicyStore::new(Some(path.clone()));
        let doc = restored.get();
        assert_eq!(doc.default_action, "DROP");
        assert_eq!(doc.workloads.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_restore_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        fs::write(&path, b"not json at all").unwrap();

        let store = PolicyStore::new(Some(path));
        assert_eq!(store.get().default_action, "ACCEPT");
    }

    #[test]
    fn test_restore_ignores_missing_default_action() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        fs::write(&path, br#"{"workloads": []}"#).unwrap();

        let store = PolicyStore::new(Some(path));
        let doc = store.get();
        assert_eq!(doc.default_action, "ACCEPT");
    }
}
