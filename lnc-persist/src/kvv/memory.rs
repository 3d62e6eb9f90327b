use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use log::*;

use crate::kvv::{Error, KVVPersister, KVVStore, KVV};

/// A key-version-value in-memory store.
#[derive(Default)]
pub struct MemoryKVVStore {
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl MemoryKVVStore {
    /// Create a new MemoryKVVStore
    pub fn new() -> KVVPersister<Self> {
        KVVPersister(Self::default())
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, (u64, Vec<u8>)>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let mut data = self.data();
        if let Some((ver, val)) = data.get(key) {
            if version < *ver {
                error!("version mismatch for {}: {} < {}", key, version, ver);
                return Err(Error::VersionMismatch);
            } else if version == *ver {
                if *val != value {
                    error!("value mismatch for {}: {}", key, version);
                    return Err(Error::VersionMismatch);
                }
                return Ok(());
            }
        }
        data.insert(key.to_string(), (version, value));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        Ok(self.data().get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.data().get(key).map(|(v, _)| *v))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data();
        let result = data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (ver, value))| KVV(k.clone(), (*ver, value.clone())))
            .collect::<Vec<_>>();
        Ok(Iter(result.into_iter()))
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.data().clear();
        Ok(())
    }
}
