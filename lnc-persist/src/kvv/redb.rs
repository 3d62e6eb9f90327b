use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::*;

use super::{KVVPersister, KVVStore, KVV};
use lightning_client::persist::Error;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const VERSION_LEN: usize = 8;

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// A key-version-value store backed by redb
pub struct RedbKVVStore {
    db: Database,
    // current version of each key, so versioning is checked without a read
    versions: Mutex<BTreeMap<String, u64>>,
}

fn storage_err(context: &str, e: impl Display) -> Error {
    error!("redb {}: {}", context, e);
    Error::Unavailable(format!("{}: {}", context, e))
}

impl RedbKVVStore {
    /// Open or create the store in directory `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<KVVPersister<Self>, Error> {
        Ok(KVVPersister(Self::new_store(path)?))
    }

    pub fn new_store<P: AsRef<Path>>(path: P) -> Result<RedbKVVStore, Error> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| storage_err("create directory", e))?;
        }
        if !path.is_dir() {
            return Err(Error::Unavailable(format!("{} is not a directory", path.display())));
        }
        let mut db = Database::create(path.join("redb")).map_err(|e| storage_err("open", e))?;
        if !db.check_integrity().map_err(|e| storage_err("integrity check", e))? {
            warn!("database at {} was repaired", path.display());
        }

        // create the table if it doesn't exist
        let tx = db.begin_write().map_err(|e| storage_err("begin write", e))?;
        tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
        tx.commit().map_err(|e| storage_err("commit", e))?;

        let mut versions = BTreeMap::new();
        {
            let tx = db.begin_read().map_err(|e| storage_err("begin read", e))?;
            let table = tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
            for item in table.iter().map_err(|e| storage_err("iterate", e))? {
                let (key, vv) = item.map_err(|e| storage_err("iterate", e))?;
                let (version, _) = Self::decode_vv(vv.value())?;
                versions.insert(key.value().to_string(), version);
            }
        }
        info!("opened {} with {} keys", path.display(), versions.len());
        Ok(Self { db, versions: Mutex::new(versions) })
    }

    fn versions(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.versions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decode_vv(vv: &[u8]) -> Result<(u64, Vec<u8>), Error> {
        if vv.len() < VERSION_LEN {
            return Err(Error::Internal(format!("short value of {} bytes", vv.len())));
        }
        let (version, value) = vv.split_at(VERSION_LEN);
        let mut version_bytes = [0u8; VERSION_LEN];
        version_bytes.copy_from_slice(version);
        Ok((u64::from_be_bytes(version_bytes), value.to_vec()))
    }

    fn encode_vv(version: u64, value: Vec<u8>) -> Vec<u8> {
        let mut vv = Vec::with_capacity(value.len() + VERSION_LEN);
        vv.extend_from_slice(&version.to_be_bytes());
        vv.extend_from_slice(&value);
        vv
    }
}

impl KVVStore for RedbKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.versions().get(key).map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    #[instrument(skip(self, value))]
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let vv = Self::encode_vv(version, value);
        let mut versions = self.versions();

        if let Some(v) = versions.get(key) {
            if version < *v {
                error!("version mismatch for {}: {} < {}", key, version, v);
                return Err(Error::VersionMismatch);
            } else if version == *v {
                let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
                let table = tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
                let existing = table.get(key).map_err(|e| storage_err("get", e))?;
                if existing.map(|e| e.value() != vv.as_slice()).unwrap_or(true) {
                    error!("value mismatch for {}: {}", key, version);
                    return Err(Error::VersionMismatch);
                }
                return Ok(());
            }
        }
        let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
        {
            let mut table = tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
            table.insert(key, vv.as_slice()).map_err(|e| storage_err("insert", e))?;
        }
        tx.commit().map_err(|e| storage_err("commit", e))?;
        versions.insert(key.to_string(), version);
        Ok(())
    }

    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
        let table = tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
        let result = table.get(key).map_err(|e| storage_err("get", e))?;
        match result {
            Some(vv) => Ok(Some(Self::decode_vv(vv.value())?)),
            None => Ok(None),
        }
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.versions().get(key).copied())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
        let table = tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
        let mut result = Vec::new();
        for item in table.range(prefix..).map_err(|e| storage_err("range", e))? {
            let (key, vv) = item.map_err(|e| storage_err("iterate", e))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let (version, value) = Self::decode_vv(vv.value())?;
            result.push(KVV(key.value().to_string(), (version, value)));
        }
        Ok(Iter(result.into_iter()))
    }

    fn clear_database(&self) -> Result<(), Error> {
        let mut versions = self.versions();
        let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
        {
            let mut table = tx.open_table(TABLE).map_err(|e| storage_err("open table", e))?;
            table.retain(|_, _| false).map_err(|e| storage_err("clear", e))?;
        }
        tx.commit().map_err(|e| storage_err("commit", e))?;
        versions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn basic_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        store.put("foo1", b"bar".to_vec())?;
        store.put("foo2", b"boo".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 0);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar");
        store.put_with_version("foo1", 1, b"bar2".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        store.put_with_version("foo1", 1, b"bar2".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar2");

        // wrong version
        assert!(store.put_with_version("foo1", 0, b"bar2".to_vec()).is_err());
        assert!(store.put_with_version("foo1", 1, b"bar3".to_vec()).is_err());

        // versions survive a reopen
        drop(store);
        let store = RedbKVVStore::new_store(tempdir.path())?;
        assert_eq!(store.get_version("foo1")?, Some(1));
        store.put("foo1", b"bar4".to_vec())?;
        assert_eq!(store.get("foo1")?, Some((2, b"bar4".to_vec())));
        Ok(())
    }

    #[test]
    fn prefix_and_clear_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        store.put("channel/02", b"2".to_vec())?;
        store.put("channel/01", b"1".to_vec())?;
        store.put("node", b"n".to_vec())?;
        let kvvs: Vec<_> = store.get_prefix("channel/")?.map(KVV::into_inner).collect();
        assert_eq!(
            kvvs,
            vec![
                ("channel/01".to_string(), (0, b"1".to_vec())),
                ("channel/02".to_string(), (0, b"2".to_vec()))
            ]
        );
        store.clear_database()?;
        assert_eq!(store.get_prefix("")?.count(), 0);
        assert_eq!(store.get_version("node")?, None);
        Ok(())
    }
}
