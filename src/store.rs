//! Persistence of a validated configuration cell
//!
//! Remembers the address the scanner accepted so the next attach can test it
//! first. Addresses are stored in link-time form and re-translated against
//! the fresh module base on load, so a saved value survives relocation.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::StaticAddress;
use crate::error::StoreError;

/// Store file name, placed next to the payload
pub const STORE_FILE: &str = "res_hook.state.json";

/// What a successful scan leaves behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub validated_address: StaticAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_function_address: Option<StaticAddress>,
    /// Unix seconds
    #[serde(default)]
    pub saved_at: u64,
}

impl PersistedConfig {
    pub fn new(validated_address: StaticAddress, apply_function_address: Option<StaticAddress>) -> Self {
        let saved_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            validated_address,
            apply_function_address,
            saved_at,
        }
    }
}

/// One durable record, scoped to an installation
pub trait PersistenceStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    fn load(&self) -> Result<Option<PersistedConfig>, StoreError>;

    fn save(&self, config: &PersistedConfig) -> Result<(), StoreError>;
}

/// On-disk layout: one record per installation namespace
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    installations: BTreeMap<String, PersistedConfig>,
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    namespace: String,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P, namespace: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            namespace: normalize_namespace(namespace),
        }
    }

    /// Store file in `dir`, keyed by the target installation directory
    pub fn in_dir<P: AsRef<Path>>(dir: P, installation: &Path) -> Self {
        Self::new(dir.as_ref().join(STORE_FILE), &installation.to_string_lossy())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Option<StoreDocument>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No store at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                warn!("Ignoring unreadable store {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }
}

impl PersistenceStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedConfig>, StoreError> {
        let config = self
            .read_document()?
            .and_then(|mut doc| doc.installations.remove(&self.namespace));
        if let Some(config) = &config {
            debug!(
                "Loaded persisted address {} for {}",
                config.validated_address, self.namespace
            );
        }
        Ok(config)
    }

    fn save(&self, config: &PersistedConfig) -> Result<(), StoreError> {
        let mut doc = self.read_document()?.unwrap_or_default();
        doc.installations.insert(self.namespace.clone(), config.clone());

        let content = serde_json::to_string_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        info!(
            "Saved address {} for {} to {}",
            config.validated_address,
            self.namespace,
            self.path.display()
        );
        Ok(())
    }
}

/// Process-lifetime store, used when no writable location exists
#[derive(Debug, Default)]
pub struct InMemoryStore {
    record: Mutex<Option<PersistedConfig>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for InMemoryStore {
    fn load(&self) -> Result<Option<PersistedConfig>, StoreError> {
        Ok(self.record.lock().map(|r| r.clone()).unwrap_or(None))
    }

    fn save(&self, config: &PersistedConfig) -> Result<(), StoreError> {
        if let Ok(mut record) = self.record.lock() {
            *record = Some(config.clone());
        }
        Ok(())
    }
}

fn normalize_namespace(namespace: &str) -> String {
    namespace
        .trim_end_matches(['/', '\\'])
        .replace('/', "\\")
        .to_ascii_lowercase()
}
