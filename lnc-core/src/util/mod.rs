/// Cryptographic utilities
pub mod crypto_utils;
/// Logging utilities
pub mod log_utils;
#[cfg(feature = "test_utils")]
#[allow(missing_docs)]
pub mod test_utils;
/// Transaction utilities
pub mod transaction_utils;

/// Per-commitment secrets are indexed downwards from this value
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;
