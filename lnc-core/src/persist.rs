use crate::channel::{Channel, ChannelId};

/// Persister error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Storage is not reachable
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The requested item was not found
    #[error("not found: {0}")]
    NotFound(String),
    /// The item already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A stored version went backwards or changed value in place
    #[error("version mismatch")]
    VersionMismatch,
    /// Stored data could not be decoded, or another internal problem
    #[error("internal: {0}")]
    Internal(String),
}

/// Durable channel storage.
///
/// Writes must be atomic per channel: a reader sees either the previous or
/// the new record, never a mix.
pub trait ChannelPersist: Send + Sync {
    /// Insert or replace the record of a channel
    fn put_channel(&self, channel: &Channel) -> Result<(), Error>;

    /// Fetch a channel, `Ok(None)` if unknown
    fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, Error>;

    /// All stored channels
    fn list_channels(&self) -> Result<Vec<Channel>, Error>;

    /// Forget a channel
    fn delete_channel(&self, id: &ChannelId) -> Result<(), Error>;
}
