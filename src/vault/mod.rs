//! Credential brokering through the password vault.
//!
//! Every action resolves its secrets fresh from the tenant's vault: the
//! target account's credential and, for jump host routes, the jump host's
//! client certificate. Nothing is cached, so a revoked or rotated secret
//! takes effect on the next request.
//!
//! ```text
//! +---------------+      resolve(endpoint, resource, account)
//! | CommandAction | ----------------------------------------+
//! +---------------+                                         |
//!                                                           v
//!                                              +---------------------+
//!                                              | CredentialResolver  |
//!                                              | (trait)             |
//!                                              +---------------------+
//!                                                           ^
//!                                                           |
//!                                              +---------------------+
//!                                              | VaultClient (HTTP)  |
//!                                              +---------------------+
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use winrm_actionhandler::vault::{VaultClient, VaultEndpoint};
//!
//! let client = VaultClient::new()?;
//! let endpoint = VaultEndpoint::new("https://vault.example.com:7272", "tenant-token");
//! let credential = client.fetch(&endpoint, "web01", "svc_autopilot").await?;
//! ```

mod client;
mod credential;
mod error;

pub use client::{VaultClient, VaultEndpoint, DEFAULT_VAULT_TIMEOUT};
pub use credential::{Credential, CredentialKind};
pub use error::{VaultError, VaultResult};

use async_trait::async_trait;

/// Resolves symbolic resource/account names to credentials.
///
/// This is the seam between the command action and the vault; tests
/// substitute in-memory implementations.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve a resource/account pair against `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::CredentialNotFound`] if the vault has no record
    /// - [`VaultError::Unreachable`] on network, TLS or token failures
    async fn resolve(
        &self,
        endpoint: &VaultEndpoint,
        resource: &str,
        account: &str,
    ) -> VaultResult<Credential>;
}
