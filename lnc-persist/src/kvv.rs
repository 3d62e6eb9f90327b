pub mod memory;
#[cfg(feature = "redb-kvv")]
pub mod redb;

use std::fmt::{self, Debug};
use std::ops::Deref;

use lightning_client::channel::{Channel, ChannelId};
use lightning_client::persist::{ChannelPersist, Error};
use log::*;
use serde_json::{from_slice, to_vec};

const CHANNEL_PREFIX: &str = "channel";
const SEPARATOR: &str = "/";

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&hex::encode(&self.1 .1)).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store.
///
/// Every put of a key bumps its version.  A delete writes an empty value
/// so versions never go backwards.
pub trait KVVStore: Send + Sync {
    type Iter: Iterator<Item = KVV>;

    /// Put a key-value pair into the store
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    /// If the key already exists, the version must be greater than the existing version.
    /// The same version with the same value is a no-op.
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error>;
    /// Get a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// Get all key-value pairs with the given prefix, in key order
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Delete a key-value pair from the store
    fn delete(&self, key: &str) -> Result<(), Error> {
        self.put(key, Vec::new())
    }
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
}

/// Adapter for a KVVStore to implement ChannelPersist.  Channels are stored
/// as JSON under `channel/<hex id>`.
pub struct KVVPersister<S: KVVStore>(pub S);

impl<S: KVVStore> Deref for KVVPersister<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: KVVStore> KVVPersister<S> {
    fn decode(key: &str, value: &[u8]) -> Result<Channel, Error> {
        from_slice(value).map_err(|e| {
            error!("could not decode {}: {}", key, e);
            Error::Internal(format!("decode {}: {}", key, e))
        })
    }
}

impl<S: KVVStore> ChannelPersist for KVVPersister<S> {
    fn put_channel(&self, channel: &Channel) -> Result<(), Error> {
        let key = make_key(CHANNEL_PREFIX, channel.id.as_bytes());
        let value = to_vec(channel).map_err(|e| Error::Internal(format!("encode {}: {}", key, e)))?;
        debug!("put {} ({} bytes)", key, value.len());
        self.put(&key, value)
    }

    fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, Error> {
        let key = make_key(CHANNEL_PREFIX, id.as_bytes());
        match self.get(&key)? {
            Some((_, value)) if !value.is_empty() => Ok(Some(Self::decode(&key, &value)?)),
            _ => Ok(None),
        }
    }

    fn list_channels(&self) -> Result<Vec<Channel>, Error> {
        let prefix = make_key(CHANNEL_PREFIX, &[]);
        let mut channels = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (_, value)) = kvv.into_inner();
            // deleted
            if value.is_empty() {
                continue;
            }
            channels.push(Self::decode(&key, &value)?);
        }
        Ok(channels)
    }

    fn delete_channel(&self, id: &ChannelId) -> Result<(), Error> {
        let key = make_key(CHANNEL_PREFIX, id.as_bytes());
        match self.get(&key)? {
            Some((_, value)) if !value.is_empty() => self.delete(&key),
            _ => Err(Error::NotFound(id.to_string())),
        }
    }
}

fn make_key(prefix: &str, key: &[u8]) -> String {
    format!("{}{}{}", prefix, SEPARATOR, hex::encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_key_test() {
        assert_eq!(make_key(CHANNEL_PREFIX, &[0xab, 0x01]), "channel/ab01");
        assert_eq!(make_key(CHANNEL_PREFIX, &[]), "channel/");
    }
}
