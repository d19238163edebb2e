use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// Matches the minimum the session actually uses for key derivation.
const MIN_LOCAL_KEY_LEN: usize = 6;

/// Persistent identity of a paired device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub address: String,
    pub name: String,
    pub device_id: String,
    pub uuid: String,
    pub local_key: String,
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Parse(String),
    Serialize(String),
    InvalidLocalKey(usize),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Store I/O error: {e}"),
            StoreError::Parse(msg) => write!(f, "Failed to parse store file: {msg}"),
            StoreError::Serialize(msg) => write!(f, "Failed to serialize store file: {msg}"),
            StoreError::InvalidLocalKey(len) => {
                write!(f, "local_key must be at least {MIN_LOCAL_KEY_LEN} characters, got {len}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Storage collaborator for paired-device credentials, keyed by transport
/// address.
pub trait CredentialStore {
    fn get(&self, address: &str) -> Result<Option<Credential>, StoreError>;
    fn put(&mut self, credential: Credential) -> Result<(), StoreError>;
    fn delete(&mut self, address: &str) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<Credential>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    devices: Vec<Credential>,
}

/// Credential store backed by a single TOML file. The whole file is read at
/// open and rewritten on every mutation.
#[derive(Debug)]
pub struct TomlStore {
    path: PathBuf,
    devices: Vec<Credential>,
}

impl TomlStore {
    /// Open a store file, creating an empty store if the file is missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let devices = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                toml::from_str::<StoreFile>(&contents)
                    .map_err(|e| StoreError::Parse(e.to_string()))?
                    .devices
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(TomlStore { path, devices })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = StoreFile {
            devices: self.devices.clone(),
        };
        let contents =
            toml::to_string_pretty(&file).map_err(|e| StoreError::Serialize(e.to_string()))?;
        std::fs::write(&self.path, contents).map_err(StoreError::Io)
    }
}

impl CredentialStore for TomlStore {
    fn get(&self, address: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.devices.iter().find(|c| c.address == address).cloned())
    }

    fn put(&mut self, credential: Credential) -> Result<(), StoreError> {
        if credential.local_key.len() < MIN_LOCAL_KEY_LEN {
            return Err(StoreError::InvalidLocalKey(credential.local_key.len()));
        }
        self.devices.retain(|c| c.address != credential.address);
        self.devices.push(credential);
        self.persist()
    }

    fn delete(&mut self, address: &str) -> Result<(), StoreError> {
        self.devices.retain(|c| c.address != address);
        self.persist()
    }

    fn list(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tuyable-{}-{}.toml", name, std::process::id()))
    }

    fn credential(address: &str) -> Credential {
        Credential {
            address: address.to_owned(),
            name: "fingerbot".to_owned(),
            device_id: "12345678901234567890".to_owned(),
            uuid: "0123456789abcdef".to_owned(),
            local_key: "abcdef".to_owned(),
        }
    }

    #[test]
    fn missing_file_opens_empty() {
        let path = temp_store("missing");
        let store = TomlStore::open(&path).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let path = temp_store("roundtrip");
        let mut store = TomlStore::open(&path).unwrap();

        store.put(credential("AA:BB:CC:DD:EE:FF")).unwrap();
        store.put(credential("11:22:33:44:55:66")).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(
            store.get("AA:BB:CC:DD:EE:FF").unwrap(),
            Some(credential("AA:BB:CC:DD:EE:FF"))
        );

        store.delete("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(store.get("AA:BB:CC:DD:EE:FF").unwrap(), None);
        assert_eq!(store.list().unwrap().len(), 1);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn put_replaces_existing_address() {
        let path = temp_store("replace");
        let mut store = TomlStore::open(&path).unwrap();

        store.put(credential("AA:BB:CC:DD:EE:FF")).unwrap();
        let mut updated = credential("AA:BB:CC:DD:EE:FF");
        updated.name = "renamed".to_owned();
        store.put(updated.clone()).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.get("AA:BB:CC:DD:EE:FF").unwrap(), Some(updated));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reopened_store_sees_persisted_devices() {
        let path = temp_store("persisted");
        {
            let mut store = TomlStore::open(&path).unwrap();
            store.put(credential("AA:BB:CC:DD:EE:FF")).unwrap();
        }

        let store = TomlStore::open(&path).unwrap();
        assert_eq!(
            store.get("AA:BB:CC:DD:EE:FF").unwrap(),
            Some(credential("AA:BB:CC:DD:EE:FF"))
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn short_local_key_is_rejected() {
        let path = temp_store("shortkey");
        let mut store = TomlStore::open(&path).unwrap();

        let mut bad = credential("AA:BB:CC:DD:EE:FF");
        bad.local_key = "abc".to_owned();
        match store.put(bad) {
            Err(StoreError::InvalidLocalKey(3)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(store.list().unwrap().is_empty());
    }
}
