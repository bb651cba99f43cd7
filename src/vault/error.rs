//! Error types for vault lookups.

use thiserror::Error;

/// Result type for vault operations.
pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// Errors that can occur while resolving a credential.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The vault has no record for the resource/account pair.
    #[error("Credentials not found in vault: resource '{resource}', account '{account}': {message}")]
    CredentialNotFound {
        /// Resource name that was queried
        resource: String,
        /// Account name that was queried
        account: String,
        /// Message reported by the vault
        message: String,
    },

    /// Network, TLS or authentication failure talking to the vault.
    #[error("Vault unreachable: {0}")]
    Unreachable(String),

    /// The vault answered with a body we could not interpret.
    #[error("Invalid vault response: {0}")]
    InvalidResponse(String),

    /// The vault endpoint configuration is unusable.
    #[error("Vault configuration error: {0}")]
    Configuration(String),
}

impl VaultError {
    /// Create a not-found error.
    pub fn not_found(
        resource: impl Into<String>,
        account: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::CredentialNotFound {
            resource: resource.into(),
            account: account.into(),
            message: message.into(),
        }
    }

    /// Whether a later attempt might succeed.
    ///
    /// Only transport failures qualify; lookups that found no record stay
    /// failed. The handler itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Unreachable(_))
    }

    /// Check if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::CredentialNotFound { .. })
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            VaultError::InvalidResponse(err.to_string())
        } else {
            VaultError::Unreachable(err.to_string())
        }
    }
}
