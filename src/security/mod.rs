use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

/// File backed store for engine credentials. Values are base64 obfuscated,
/// not encrypted.
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    store: VaultStore,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultStore {
    entries: HashMap<String, String>,
}

#[derive(Debug)]
pub enum VaultError {
    Io(io::Error),
    Json(serde_json::Error),
    MissingKey(String),
    Corrupt { key: String, reason: String },
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "vault io error: {err}"),
            Self::Json(err) => write!(f, "vault json error: {err}"),
            Self::MissingKey(key) => write!(f, "missing vault key: {key}"),
            Self::Corrupt { key, reason } => write!(f, "vault entry {key} is corrupt: {reason}"),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<io::Error> for VaultError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl Vault {
    pub fn new(path: Option<&str>) -> Result<Self, VaultError> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => default_vault_path(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            VaultStore::default()
        };

        Ok(Self { path, store })
    }

    pub fn store(&mut self, key: &str, value: &str) -> Result<(), VaultError> {
        let encoded = general_purpose::STANDARD.encode(value.as_bytes());
        self.store.entries.insert(key.to_string(), encoded);
        self.persist()
    }

    pub fn retrieve(&self, key: &str) -> Result<String, VaultError> {
        let encoded = self
            .store
            .entries
            .get(key)
            .ok_or_else(|| VaultError::MissingKey(key.to_string()))?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| VaultError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        String::from_utf8(decoded).map_err(|err| VaultError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        })
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn persist(&self) -> Result<(), VaultError> {
        let data = serde_json::to_string_pretty(&self.store)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

fn default_vault_path() -> PathBuf {
    let base = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join("QsysCoreLink").join("vault.json")
}
