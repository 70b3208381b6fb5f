//! Persisted connection state.
//!
//! The last server endpoint is written when the receiver shuts down and read
//! back (then cleared) on the next resume, so a resumed session reconnects
//! without waiting for discovery.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use wavry_vr::{ServerEndpoint, VrError, VrResult};

pub trait SettingsStore: Send + Sync {
    fn load_endpoint(&self) -> VrResult<Option<ServerEndpoint>>;
    /// `None` clears the stored endpoint.
    fn save_endpoint(&self, endpoint: Option<&ServerEndpoint>) -> VrResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    server_address: Option<String>,
    #[serde(default)]
    server_port: u16,
}

impl PersistedState {
    fn endpoint(&self) -> Option<ServerEndpoint> {
        let address = self.server_address.as_ref()?;
        if address.is_empty() {
            return None;
        }
        Some(ServerEndpoint {
            address: address.clone(),
            port: self.server_port,
        })
    }
}

/// JSON file store.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load_endpoint(&self) -> VrResult<Option<ServerEndpoint>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VrError::Settings(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let state: PersistedState = serde_json::from_str(&raw)
            .map_err(|e| VrError::Settings(format!("parse {}: {e}", self.path.display())))?;
        Ok(state.endpoint())
    }

    fn save_endpoint(&self, endpoint: Option<&ServerEndpoint>) -> VrResult<()> {
        let state = match endpoint {
            Some(endpoint) => PersistedState {
                server_address: Some(endpoint.address.clone()),
                server_port: endpoint.port,
            },
            None => PersistedState::default(),
        };
        let raw = serde_json::to_string_pretty(&state)
            .map_err(|e| VrError::Settings(format!("encode: {e}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    VrError::Settings(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        fs::write(&self.path, raw)
            .map_err(|e| VrError::Settings(format!("write {}: {e}", self.path.display())))
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    endpoint: Mutex<Option<ServerEndpoint>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint: Mutex::new(Some(endpoint)),
        }
    }

    pub fn peek(&self) -> Option<ServerEndpoint> {
        match self.endpoint.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_endpoint(&self) -> VrResult<Option<ServerEndpoint>> {
        Ok(self.peek())
    }

    fn save_endpoint(&self, endpoint: Option<&ServerEndpoint>) -> VrResult<()> {
        let mut guard = match self.endpoint.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = endpoint.cloned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "wavry-vr-settings-{tag}-{}.json",
            std::process::id()
        ))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let store = JsonSettingsStore::new(temp_path("missing"));
        assert_eq!(store.load_endpoint().unwrap(), None);
    }

    #[test]
    fn test_json_store_round_trip_and_clear() {
        let path = temp_path("roundtrip");
        let store = JsonSettingsStore::new(&path);
        let endpoint = ServerEndpoint {
            address: "192.168.1.20".into(),
            port: 9944,
        };

        store.save_endpoint(Some(&endpoint)).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"server_address\""));
        assert_eq!(store.load_endpoint().unwrap(), Some(endpoint));

        store.save_endpoint(None).unwrap();
        assert_eq!(store.load_endpoint().unwrap(), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_reports_settings_error() {
        let path = temp_path("corrupt");
        fs::write(&path, "{ not json").unwrap();
        let result = JsonSettingsStore::new(&path).load_endpoint();
        let _ = fs::remove_file(&path);
        assert!(matches!(result, Err(VrError::Settings(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySettingsStore::with_endpoint(ServerEndpoint {
            address: "10.0.0.2".into(),
            port: 9944,
        });
        assert!(store.load_endpoint().unwrap().is_some());
        store.save_endpoint(None).unwrap();
        assert_eq!(store.peek(), None);
    }
}
