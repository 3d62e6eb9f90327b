//! Peer wire messages for the channel client.
//!
//! Every message is a big-endian `u16` type followed by the message body.
//! Framing (length prefixes, encryption) is the transport's concern.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod msgs;
mod ser;

pub use error::{Error, Result};
pub use ser::{Reader, WireField, Writer};

/// The largest payload a single peer message may carry
pub const MAX_MESSAGE_SIZE: usize = 65535;
