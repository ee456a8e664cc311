use crate::sign::{SignError, SigningKey};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy file {path} unreadable: {source}")]
    ConfigUnreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("policy file {path} is not valid JSON: {source}")]
    ConfigInvalid {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Key(#[from] SignError),
}

/// Process-wide bypass configuration. Bootstrapped from a JSON file,
/// mutated only through `PolicyStore::update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyState {
    pub mitm_enabled: bool,
    pub bypass_pin: bool,
    pub cdcvm_enabled: bool,
    pub enhanced_limits: bool,
    pub block_all: bool,
    pub private_key_path: Option<PathBuf>,
}

impl Default for PolicyState {
    fn default() -> Self {
        PolicyState {
            mitm_enabled: true,
            bypass_pin: true,
            cdcvm_enabled: true,
            enhanced_limits: false,
            block_all: false,
            private_key_path: None,
        }
    }
}

/// Partial update; absent fields keep their current value. Session CONFIG
/// frames are filtered to the CONFIG-allowed subset before they reach
/// `update`; the full patch surface exists for the admin interface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyPatch {
    #[serde(default)]
    pub mitm_enabled: Option<bool>,
    #[serde(default)]
    pub bypass_pin: Option<bool>,
    #[serde(default)]
    pub cdcvm_enabled: Option<bool>,
    #[serde(default)]
    pub enhanced_limits: Option<bool>,
    #[serde(default)]
    pub block_all: Option<bool>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

impl PolicyPatch {
    /// Strip the fields a relay session is never allowed to change.
    pub fn config_frame_allowed(mut self) -> PolicyPatch {
        if self.block_all.is_some() {
            warn!("CONFIG frame tried to change block_all, ignoring");
            self.block_all = None;
        }
        if self.private_key_path.is_some() {
            warn!("CONFIG frame tried to change the key path, ignoring");
            self.private_key_path = None;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mitm_enabled.is_none()
            && self.bypass_pin.is_none()
            && self.cdcvm_enabled.is_none()
            && self.enhanced_limits.is_none()
            && self.block_all.is_none()
            && self.private_key_path.is_none()
    }
}

/// Atomic view of the policy valid for the duration of one frame.
#[derive(Clone)]
pub struct PolicySnapshot {
    pub policy: Arc<PolicyState>,
    pub key: Option<Arc<SigningKey>>,
}

struct Inner {
    policy: Arc<PolicyState>,
    key: Option<Arc<SigningKey>>,
}

/// Single-writer multi-reader policy store. Readers take an `Arc` snapshot;
/// writers serialize behind the write lock and reload the signing key
/// synchronously when its path changes.
pub struct PolicyStore {
    inner: RwLock<Inner>,
}

impl PolicyStore {
    /// Build a store from an explicit state, loading the signing key when a
    /// path is configured. A configured-but-unreadable key is fatal.
    pub fn new(state: PolicyState) -> Result<PolicyStore, PolicyError> {
        let key = match &state.private_key_path {
            Some(path) => Some(Arc::new(SigningKey::load(path)?)),
            None => {
                info!("no private key configured, responses will be unsigned");
                None
            }
        };

        Ok(PolicyStore {
            inner: RwLock::new(Inner {
                policy: Arc::new(state),
                key,
            }),
        })
    }

    /// Read the bootstrap JSON file and build the store.
    pub fn bootstrap(path: &Path) -> Result<PolicyStore, PolicyError> {
        let raw = fs::read_to_string(path).map_err(|source| PolicyError::ConfigUnreadable {
            path: path.display().to_string(),
            source,
        })?;

        let state: PolicyState =
            serde_json::from_str(&raw).map_err(|source| PolicyError::ConfigInvalid {
                path: path.display().to_string(),
                source,
            })?;

        info!(
            "policy bootstrapped from {}: mitm={} bypass_pin={} cdcvm={} enhanced_limits={} block_all={}",
            path.display(),
            state.mitm_enabled,
            state.bypass_pin,
            state.cdcvm_enabled,
            state.enhanced_limits,
            state.block_all
        );

        PolicyStore::new(state)
    }

    pub fn read(&self) -> PolicySnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        PolicySnapshot {
            policy: Arc::clone(&inner.policy),
            key: inner.key.clone(),
        }
    }

    /// Apply a patch. A patch changing `private_key_path` loads the new key
    /// first and is rejected wholesale on failure, keeping the prior key.
    pub fn update(&self, patch: &PolicyPatch) -> Result<(), PolicyError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let mut state = (*inner.policy).clone();

        let new_key = match &patch.private_key_path {
            Some(path) if Some(path) != state.private_key_path.as_ref() => {
                let key = SigningKey::load(path)?;
                info!("signing key switched to {}", path.display());
                Some(Arc::new(key))
            }
            _ => inner.key.clone(),
        };

        if let Some(value) = patch.mitm_enabled {
            state.mitm_enabled = value;
        }
        if let Some(value) = patch.bypass_pin {
            state.bypass_pin = value;
        }
        if let Some(value) = patch.cdcvm_enabled {
            state.cdcvm_enabled = value;
        }
        if let Some(value) = patch.enhanced_limits {
            state.enhanced_limits = value;
        }
        if let Some(value) = patch.block_all {
            state.block_all = value;
        }
        if let Some(path) = &patch.private_key_path {
            state.private_key_path = Some(path.clone());
        }

        debug!(
            "policy updated: mitm={} bypass_pin={} cdcvm={} enhanced_limits={} block_all={}",
            state.mitm_enabled,
            state.bypass_pin,
            state.cdcvm_enabled,
            state.enhanced_limits,
            state.block_all
        );

        inner.policy = Arc::new(state);
        inner.key = new_key;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;
    use std::io::Write;

    fn write_key() -> PathBuf {
        let rsa = Rsa::generate(1024).unwrap();
        let pem = rsa.private_key_to_pem().unwrap();
        let mut path = std::env::temp_dir();
        path.push(format!("mitmcore_policy_key_{}.pem", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&pem).unwrap();
        path
    }

    #[test]
    fn test_bootstrap_roundtrip() {
        let mut path = std::env::temp_dir();
        path.push(format!("mitmcore_policy_{}.json", std::process::id()));
        fs::write(
            &path,
            r#"{"mitm_enabled":true,"bypass_pin":false,"cdcvm_enabled":true,"enhanced_limits":true,"block_all":false,"private_key_path":null}"#,
        )
        .unwrap();

        let store = PolicyStore::bootstrap(&path).unwrap();
        let snapshot = store.read();
        assert!(!snapshot.policy.bypass_pin);
        assert!(snapshot.policy.enhanced_limits);
        assert!(snapshot.key.is_none());

        fs::remove_file(path).ok();
    }

    #[test]
    fn test_bootstrap_missing_file() {
        let err = PolicyStore::bootstrap(Path::new("/nonexistent/policy.json")).unwrap_err();
        assert!(matches!(err, PolicyError::ConfigUnreadable { .. }));
    }

    #[test]
    fn test_bootstrap_invalid_json() {
        let mut path = std::env::temp_dir();
        path.push(format!("mitmcore_policy_bad_{}.json", std::process::id()));
        fs::write(&path, "{ nope").unwrap();
        let err = PolicyStore::bootstrap(&path).unwrap_err();
        assert!(matches!(err, PolicyError::ConfigInvalid { .. }));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_update_is_visible_to_new_snapshots() {
        let store = PolicyStore::new(PolicyState::default()).unwrap();
        let before = store.read();

        let patch = PolicyPatch {
            bypass_pin: Some(false),
            ..PolicyPatch::default()
        };
        store.update(&patch).unwrap();

        // the old snapshot is unchanged, the new one sees the update
        assert!(before.policy.bypass_pin);
        assert!(!store.read().policy.bypass_pin);
    }

    #[test]
    fn test_key_reload_failure_rejects_patch() {
        let key_path = write_key();
        let state = PolicyState {
            private_key_path: Some(key_path.clone()),
            ..PolicyState::default()
        };
        let store = PolicyStore::new(state).unwrap();
        assert!(store.read().key.is_some());

        let patch = PolicyPatch {
            bypass_pin: Some(false),
            private_key_path: Some(PathBuf::from("/nonexistent/key.pem")),
            ..PolicyPatch::default()
        };
        assert!(store.update(&patch).is_err());

        // prior key and prior fields survive the rejected patch
        let snapshot = store.read();
        assert!(snapshot.key.is_some());
        assert!(snapshot.policy.bypass_pin);
        assert_eq!(snapshot.policy.private_key_path, Some(key_path.clone()));

        fs::remove_file(key_path).ok();
    }

    #[test]
    fn test_config_frame_filter() {
        let patch = PolicyPatch {
            bypass_pin: Some(false),
            block_all: Some(true),
            private_key_path: Some(PathBuf::from("/tmp/x.pem")),
            ..PolicyPatch::default()
        };
        let filtered = patch.config_frame_allowed();
        assert_eq!(filtered.bypass_pin, Some(false));
        assert!(filtered.block_all.is_none());
        assert!(filtered.private_key_path.is_none());
    }

    #[test]
    fn test_missing_key_path_is_unsigned_not_fatal() {
        let store = PolicyStore::new(PolicyState::default()).unwrap();
        assert!(store.read().key.is_none());
    }

    #[test]
    fn test_configured_unreadable_key_is_fatal() {
        let state = PolicyState {
            private_key_path: Some(PathBuf::from("/nonexistent/key.pem")),
            ..PolicyState::default()
        };
        assert!(matches!(
            PolicyStore::new(state),
            Err(PolicyError::Key(SignError::KeyUnreadable { .. }))
        ));
    }
}
