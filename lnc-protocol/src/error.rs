use core::fmt;

/// Error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An even message type we do not understand
    UnknownEvenType(u16),
    /// The message type does not belong where it was read
    UnexpectedType(u16),
    ShortRead,
    MessageTooLarge,
    InvalidPublicKey,
    InvalidSignature,
    /// A field held a value outside its domain
    InvalidValue(&'static str),
    Eof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownEvenType(t) => write!(f, "unknown even message type {}", t),
            Error::UnexpectedType(t) => write!(f, "unexpected message type {}", t),
            Error::ShortRead => write!(f, "short read"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::InvalidPublicKey => write!(f, "invalid public key"),
            Error::InvalidSignature => write!(f, "invalid signature encoding"),
            Error::InvalidValue(field) => write!(f, "invalid value for {}", field),
            Error::Eof => write!(f, "end of input"),
        }
    }
}

impl std::error::Error for Error {}

/// Result
pub type Result<T> = core::result::Result<T, Error>;
