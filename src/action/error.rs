//! Terminal action errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::codec::CodecError;
use crate::session::SessionError;
use crate::vault::VaultError;

/// Error kind recorded on a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The vault has no record for the resource/account
    CredentialNotFound,
    /// The vault could not be reached or rejected the token
    VaultUnreachable,
    /// Tenant or jump host configuration is incomplete
    ConfigurationMissing,
    /// A hop refused the session
    SessionEstablishment,
    /// The transport failed while running the script
    RemoteExecution,
    /// The handler stopped the action before it finished
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CredentialNotFound => "CredentialNotFound",
            ErrorKind::VaultUnreachable => "VaultUnreachable",
            ErrorKind::ConfigurationMissing => "ConfigurationMissing",
            ErrorKind::SessionEstablishment => "SessionEstablishmentError",
            ErrorKind::RemoteExecution => "RemoteExecutionError",
            ErrorKind::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Why an action reached `Failed`.
///
/// The message is carried verbatim into the result's status message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The vault has no record for the resource/account.
    #[error("{0}")]
    CredentialNotFound(String),

    /// The vault could not be reached.
    #[error("{0}")]
    VaultUnreachable(String),

    /// Tenant or jump host configuration is incomplete.
    #[error("{0}")]
    ConfigurationMissing(String),

    /// A hop refused the session.
    #[error("{0}")]
    SessionEstablishment(String),

    /// The transport failed while running the script.
    #[error("{0}")]
    RemoteExecution(String),

    /// The handler stopped the action, during shutdown or after its task died.
    #[error("{0}")]
    Aborted(String),
}

impl ActionError {
    /// Kind recorded on the result.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::CredentialNotFound(_) => ErrorKind::CredentialNotFound,
            ActionError::VaultUnreachable(_) => ErrorKind::VaultUnreachable,
            ActionError::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            ActionError::SessionEstablishment(_) => ErrorKind::SessionEstablishment,
            ActionError::RemoteExecution(_) => ErrorKind::RemoteExecution,
            ActionError::Aborted(_) => ErrorKind::Aborted,
        }
    }

    /// Prefix the message, keeping the kind.
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        let wrap = |message: String| format!("{}: {}", prefix, message);
        match self {
            ActionError::CredentialNotFound(m) => ActionError::CredentialNotFound(wrap(m)),
            ActionError::VaultUnreachable(m) => ActionError::VaultUnreachable(wrap(m)),
            ActionError::ConfigurationMissing(m) => ActionError::ConfigurationMissing(wrap(m)),
            ActionError::SessionEstablishment(m) => ActionError::SessionEstablishment(wrap(m)),
            ActionError::RemoteExecution(m) => ActionError::RemoteExecution(wrap(m)),
            ActionError::Aborted(m) => ActionError::Aborted(wrap(m)),
        }
    }
}

impl From<VaultError> for ActionError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::CredentialNotFound { .. } => ActionError::CredentialNotFound(err.to_string()),
            VaultError::Unreachable(_) | VaultError::InvalidResponse(_) => {
                ActionError::VaultUnreachable(err.to_string())
            }
            VaultError::Configuration(_) => ActionError::ConfigurationMissing(err.to_string()),
        }
    }
}

impl From<SessionError> for ActionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Establishment { .. } => ActionError::SessionEstablishment(err.to_string()),
            SessionError::Execution { .. } => ActionError::RemoteExecution(err.to_string()),
        }
    }
}

impl From<CodecError> for ActionError {
    fn from(err: CodecError) -> Self {
        ActionError::RemoteExecution(err.to_string())
    }
}
