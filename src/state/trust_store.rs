//! Host key trust store using redb
//!
//! Persists the trust-on-first-use decisions made for SSH servers:
//! one record per `host:port`, holding the base64 key string the user approved.
//!
//! Database: known_hosts.redb
//! Tables:
//!   - SSHTunnel_KnownHosts: "host:port" -> key string
//!   - SSHTunnel_Metadata: "version" -> schema version (MessagePack u32)

#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Schema version written by this build
pub const TRUST_STORE_VERSION: u32 = 1;

/// Fixed store identifier, used as the table name
pub const TRUST_STORE_ID: &str = "SSHTunnel_KnownHosts";

const KNOWN_HOSTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new(TRUST_STORE_ID);

const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("SSHTunnel_Metadata");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trust store schema v{found} is newer than supported v{supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// `(hostname, port)` pair used as the trust store key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    host: String,
    port: u16,
}

impl HostIdentity {
    /// Hostnames are case-insensitive, so the host is stored lowercased
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim().to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One trusted host key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    pub host_identity: String,
    pub key: String,
}

/// Persistent `host:port -> key string` mapping
///
/// Implementations are synchronous; every `upsert` is durable before it returns.
pub trait TrustStore: Send + Sync {
    fn lookup(&self, host_identity: &str) -> Result<Option<String>, StoreError>;

    fn upsert(&self, host_identity: &str, key: &str) -> Result<(), StoreError>;

    /// Returns `true` if a record was removed
    fn remove(&self, host_identity: &str) -> Result<bool, StoreError>;

    fn entries(&self) -> Result<Vec<TrustRecord>, StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// redb-backed store
// ═══════════════════════════════════════════════════════════════════════════

pub struct RedbTrustStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbTrustStore {
    /// Open (or create) the trust store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::create(&path) {
            Ok(db) => {
                info!("Trust store opened at {:?}", path);
                db
            }
            // Another process holds the lock; the file itself is fine
            Err(e @ redb::DatabaseError::DatabaseAlreadyOpen) => return Err(e.into()),
            Err(e) => {
                warn!("Failed to open trust store: {:?}, attempting recovery", e);

                let backup_path = path.with_extension(format!(
                    "redb.{}.backup",
                    chrono::Local::now().format("%Y%m%d_%H%M%S")
                ));
                if let Err(e) = std::fs::rename(&path, &backup_path) {
                    error!("Failed to backup corrupted trust store: {:?}", e);
                } else {
                    info!("Backed up corrupted trust store to {:?}", backup_path);
                }

                Database::create(&path)?
            }
        };

        // Set file permissions to 600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                warn!("Failed to set trust store permissions: {}", e);
            }
        }

        let store = Self {
            db: Arc::new(db),
            path,
        };
        store.initialize()?;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;

        {
            let _ = write_txn.open_table(KNOWN_HOSTS_TABLE)?;
            let mut meta = write_txn.open_table(METADATA_TABLE)?;

            let existing_version = match meta.get("version")? {
                Some(v) => Some(rmp_serde::from_slice::<u32>(v.value())?),
                None => None,
            };

            match existing_version {
                Some(found) if found > TRUST_STORE_VERSION => {
                    return Err(StoreError::UnsupportedVersion {
                        found,
                        supported: TRUST_STORE_VERSION,
                    });
                }
                Some(found) if found == TRUST_STORE_VERSION => {}
                other => {
                    if let Some(found) = other {
                        info!(
                            "Migrating trust store from v{} to v{}",
                            found, TRUST_STORE_VERSION
                        );
                    }
                    let version_bytes = rmp_serde::to_vec(&TRUST_STORE_VERSION)?;
                    meta.insert("version", version_bytes.as_slice())?;
                }
            }
        }

        write_txn.commit()?;
        debug!("Trust store initialized");
        Ok(())
    }
}

impl TrustStore for RedbTrustStore {
    fn lookup(&self, host_identity: &str) -> Result<Option<String>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KNOWN_HOSTS_TABLE)?;
        Ok(table.get(host_identity)?.map(|v| v.value().to_string()))
    }

    fn upsert(&self, host_identity: &str, key: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KNOWN_HOSTS_TABLE)?;
            table.insert(host_identity, key)?;
        }
        write_txn.commit()?;

        info!("Trusted host key stored for {}", host_identity);
        Ok(())
    }

    fn remove(&self, host_identity: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(KNOWN_HOSTS_TABLE)?;
            let removed = table.remove(host_identity)?.is_some();
            removed
        };
        write_txn.commit()?;

        if removed {
            info!("Removed trusted host key for {}", host_identity);
        }
        Ok(removed)
    }

    fn entries(&self) -> Result<Vec<TrustRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KNOWN_HOSTS_TABLE)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (k, v) = result?;
            records.push(TrustRecord {
                host_identity: k.value().to_string(),
                key: v.value().to_string(),
            });
        }
        Ok(records)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════

/// Non-persistent store, for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryTrustStore {
    records: RwLock<BTreeMap<String, String>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given records already trusted
    pub fn seeded<I, K, V>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl TrustStore for MemoryTrustStore {
    fn lookup(&self, host_identity: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records.read().get(host_identity).cloned())
    }

    fn upsert(&self, host_identity: &str, key: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(host_identity.to_string(), key.to_string());
        Ok(())
    }

    fn remove(&self, host_identity: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(host_identity).is_some())
    }

    fn entries(&self) -> Result<Vec<TrustRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(k, v)| TrustRecord {
                host_identity: k.clone(),
                key: v.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (RedbTrustStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.redb");
        let store = RedbTrustStore::open(path).unwrap();
        (store, dir)
    }

    #[test]
    fn test_host_identity() {
        let id = HostIdentity::new("SSH.Example.COM", 2222);
        assert_eq!(id.to_string(), "ssh.example.com:2222");
        assert_eq!(id.host(), "ssh.example.com");
        assert_eq!(id.port(), 2222);
    }

    #[test]
    fn test_upsert_and_lookup() {
        let (store, _dir) = create_test_store();

        assert_eq!(store.lookup("example.com:22").unwrap(), None);

        store.upsert("example.com:22", "AAAAkey1").unwrap();
        assert_eq!(
            store.lookup("example.com:22").unwrap(),
            Some("AAAAkey1".to_string())
        );

        // Last write wins
        store.upsert("example.com:22", "AAAAkey2").unwrap();
        assert_eq!(
            store.lookup("example.com:22").unwrap(),
            Some("AAAAkey2".to_string())
        );
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let (store, _dir) = create_test_store();

        store.upsert("example.com:22", "AAAAkey1").unwrap();
        assert!(store.remove("example.com:22").unwrap());
        assert!(!store.remove("example.com:22").unwrap());
        assert_eq!(store.lookup("example.com:22").unwrap(), None);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.redb");

        {
            let store = RedbTrustStore::open(&path).unwrap();
            store.upsert("a.example.com:22", "AAAAkeyA").unwrap();
            store.upsert("b.example.com:443", "AAAAkeyB").unwrap();
        }

        let store = RedbTrustStore::open(&path).unwrap();
        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            store.lookup("b.example.com:443").unwrap(),
            Some("AAAAkeyB".to_string())
        );
    }

    #[test]
    fn test_newer_schema_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.redb");

        drop(RedbTrustStore::open(&path).unwrap());

        {
            let db = Database::create(&path).unwrap();
            let write_txn = db.begin_write().unwrap();
            {
                let mut meta = write_txn.open_table(METADATA_TABLE).unwrap();
                let bytes = rmp_serde::to_vec(&(TRUST_STORE_VERSION + 1)).unwrap();
                meta.insert("version", bytes.as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
        }

        match RedbTrustStore::open(&path) {
            Err(StoreError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, TRUST_STORE_VERSION + 1);
                assert_eq!(supported, TRUST_STORE_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_corrupted_file_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.redb");
        std::fs::write(&path, b"definitely not a redb file").unwrap();

        let store = RedbTrustStore::open(&path).unwrap();
        assert!(store.entries().unwrap().is_empty());

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTrustStore::seeded([("example.com:22", "AAAAkey1")]);
        assert_eq!(
            store.lookup("example.com:22").unwrap(),
            Some("AAAAkey1".to_string())
        );
        store.upsert("other.com:22", "AAAAkey2").unwrap();
        assert_eq!(store.entries().unwrap().len(), 2);
        assert!(store.remove("other.com:22").unwrap());
    }
}
