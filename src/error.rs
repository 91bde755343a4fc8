//! # Error Types for the TRAIN Bitcoin Engine
//!
//! Every failure the engine can report, grouped the way callers need to react to them:
//! input validation, insufficient funds, cryptographic shape violations and
//! provider (network) failures.

use thiserror::Error;

/// Main error type for all swap operations
#[derive(Debug, Error)]
pub enum SwapError {
    /// Malformed caller input (hex, amounts, arithmetic producing negative values)
    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// Fixed-width field with the wrong length
    #[error("Invalid length for {field}: expected {expected} bytes, got {actual} bytes")]
    InvalidLength {
        field: String,
        expected: usize,
        actual: usize,
    },

    /// Refund delay below the protocol griefing window
    #[error("Timelock delay too short: minimum {minimum} seconds, got {actual} seconds")]
    TimelockTooShort { minimum: u64, actual: u64 },

    /// Timelock that cannot be encoded (out of range, not a timestamp, wrong type flag)
    #[error("Invalid timelock: {message}")]
    InvalidTimelock { message: String },

    /// Selected UTXOs do not cover amount + fee
    #[error("Insufficient funds: required {required} sats, available {available} sats (short by {shortfall} sats)")]
    InsufficientFunds {
        required: u64,
        available: u64,
        shortfall: u64,
    },

    /// Generic cryptographic failure (tweaking, key parsing, sighash computation)
    #[error("Cryptographic operation failed: {message}")]
    Cryptography { message: String },

    /// A tapleaf or witness script does not have the expected shape
    #[error("Script does not match the {leaf} leaf shape: {message}")]
    LeafMismatch { leaf: String, message: String },

    /// SHA256(secret) differs from the hashlock committed in the leaf
    #[error("Secret does not hash to the committed hashlock: expected {expected}, got {actual}")]
    HashlockMismatch { expected: String, actual: String },

    /// A signing key does not match the key embedded in the script
    #[error("Key mismatch: script expects {expected}, signer provided {actual}")]
    KeyMismatch { expected: String, actual: String },

    /// Signature of the wrong size or failing verification
    #[error("Invalid signature: {message}")]
    InvalidSignature { message: String },

    /// Refund attempted before the relative timelock elapsed
    #[error("CSV delay not satisfied: needed {needed_secs} seconds, elapsed {elapsed_secs} seconds")]
    CsvDelayNotSatisfied { needed_secs: u64, elapsed_secs: u64 },

    /// Errors during transaction or PSBT construction
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// Network request failures (explorer API)
    #[error("Network request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    /// Chain-data provider reported an error or returned unusable data
    #[error("Provider operation {operation} failed: {message}")]
    Provider { operation: String, message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Hex decoding errors
    #[error("Hex decoding error: {source}")]
    Hex {
        #[from]
        source: hex::FromHexError,
    },
}

/// Result type alias for swap operations
pub type SwapResult<T> = Result<T, SwapError>;

impl SwapError {
    /// Create an input validation error
    pub fn input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a length validation error
    pub fn length(field: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::InvalidLength {
            field: field.into(),
            expected,
            actual,
        }
    }

    /// Create a cryptography error with a message
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Cryptography {
            message: message.into(),
        }
    }

    /// Create a leaf shape mismatch error
    pub fn leaf(leaf: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LeafMismatch {
            leaf: leaf.into(),
            message: message.into(),
        }
    }

    /// Create a transaction assembly error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a provider error
    pub fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable (network/temporary issues)
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwapError::Network { .. } | SwapError::Provider { .. })
    }

    /// Check if this error means a spend would have been malformed or mismatched.
    ///
    /// These abort before any witness is assembled; broadcasting past them can lock
    /// funds irrecoverably.
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            SwapError::Cryptography { .. }
                | SwapError::LeafMismatch { .. }
                | SwapError::HashlockMismatch { .. }
                | SwapError::KeyMismatch { .. }
                | SwapError::InvalidSignature { .. }
                | SwapError::CsvDelayNotSatisfied { .. }
        )
    }
}

/// Explorer client specific errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// HTTP request failures
    #[error("HTTP request failed: {status} - {message}")]
    HttpError { status: u16, message: String },

    /// API response validation errors
    #[error("Invalid API response: {message}")]
    InvalidResponse { message: String },
}

impl From<NetworkError> for SwapError {
    fn from(err: NetworkError) -> Self {
        SwapError::provider("explorer", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let input_err = SwapError::input("amount", "must be positive");
        assert!(matches!(input_err, SwapError::InvalidInput { .. }));
        assert!(!input_err.is_security_critical());

        let crypto_err = SwapError::crypto("tweak failed");
        assert!(matches!(crypto_err, SwapError::Cryptography { .. }));
        assert!(crypto_err.is_security_critical());
    }

    #[test]
    fn test_error_classification() {
        let provider_err: SwapError = NetworkError::HttpError {
            status: 503,
            message: "unavailable".to_string(),
        }
        .into();
        assert!(provider_err.is_retryable());
        assert!(!provider_err.is_security_critical());

        let csv_err = SwapError::CsvDelayNotSatisfied {
            needed_secs: 1024,
            elapsed_secs: 100,
        };
        assert!(csv_err.is_security_critical());
        assert!(!csv_err.is_retryable());
    }

    #[test]
    fn test_insufficient_funds_message_names_shortfall() {
        let err = SwapError::InsufficientFunds {
            required: 100_311,
            available: 100_000,
            shortfall: 311,
        };
        assert!(err.to_string().contains("short by 311 sats"));
    }
}
