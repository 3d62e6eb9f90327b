//! Durable [`ChannelPersist`](lightning_client::persist::ChannelPersist)
//! implementations.

#[cfg(feature = "kvv")]
pub mod kvv;
