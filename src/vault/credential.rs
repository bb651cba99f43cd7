//! Credentials handed out by the vault.

use std::fmt;

/// A resolved secret.
///
/// Secret material is never printed: the `Debug` implementation redacts it,
/// so credentials can travel through `tracing` fields safely.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username and password
    Password {
        /// Account name
        username: String,
        /// Plaintext password
        password: String,
    },
    /// Bearer token
    Token {
        /// Token value
        token: String,
    },
    /// Client certificate and private key, PEM encoded
    Certificate {
        /// Certificate chain followed by the private key
        pem: String,
    },
}

/// Discriminant of a [`Credential`], for messages and checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Username and password
    Password,
    /// Bearer token
    Token,
    /// Client certificate
    Certificate,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Password => write!(f, "password"),
            CredentialKind::Token => write!(f, "token"),
            CredentialKind::Certificate => write!(f, "certificate"),
        }
    }
}

impl Credential {
    /// Create a password credential.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create a token credential.
    pub fn token(token: impl Into<String>) -> Self {
        Credential::Token {
            token: token.into(),
        }
    }

    /// Create a certificate credential from PEM text.
    pub fn certificate(pem: impl Into<String>) -> Self {
        Credential::Certificate { pem: pem.into() }
    }

    /// Get the credential kind.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Password { .. } => CredentialKind::Password,
            Credential::Token { .. } => CredentialKind::Token,
            Credential::Certificate { .. } => CredentialKind::Certificate,
        }
    }

    /// Get the username, if this credential carries one.
    pub fn username(&self) -> Option<&str> {
        match self {
            Credential::Password { username, .. } => Some(username),
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Credential::Token { .. } => f
                .debug_struct("Token")
                .field("token", &"[REDACTED]")
                .finish(),
            Credential::Certificate { pem } => f
                .debug_struct("Certificate")
                .field("pem_len", &pem.len())
                .finish(),
        }
    }
}
