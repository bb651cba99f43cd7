//! Error types for the WinRM action handler.
//!
//! Each component owns a focused error enum ([`VaultError`], [`CodecError`],
//! [`SessionError`], [`ConfigError`], [`PoolError`]). This module aggregates
//! them into one [`Error`] for callers that drive several components, such as
//! the command-line front end.
//!
//! Note that a [`CommandAction`](crate::action::CommandAction) never returns
//! any of these: its failures are folded into a failed
//! [`ExecutionResult`](crate::action::ExecutionResult).

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::session::SessionError;
use crate::vault::VaultError;

/// Result type alias for handler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the handler.
#[derive(Error, Debug)]
pub enum Error {
    /// Loading or querying the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Talking to the vault failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Encoding a script or decoding its output failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Opening or using a WinRM session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The action pool rejected work.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A task request could not be parsed.
    #[error("Invalid task request on line {line}: {message}")]
    InvalidRequest {
        /// 1-based line number in the batch input
        line: usize,
        /// Parser message
        message: String,
    },

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid request error.
    pub fn invalid_request(line: usize, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            line,
            message: message.into(),
        }
    }
}
