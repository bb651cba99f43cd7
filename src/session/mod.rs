//! WinRM session brokering.
//!
//! A session is opened either directly against the target host or through a
//! jump host that forwards the work to the target over PowerShell remoting:
//!
//! ```text
//! direct:   handler --(WS-Man, target credential)--> target
//!
//! proxied:  handler --(WS-Man, jump client cert)--> jump host
//!                                                     |
//!                New-PSSession (forwarded password credential, sent on stdin)
//!                                                     v
//!                                                   target
//! ```
//!
//! The [`SessionBroker`] and [`RemoteSession`] traits are the seams the
//! command action talks to; [`WsmanBroker`] is the HTTP implementation.

mod broker;
mod certificate;
mod wsman;

pub use broker::{BrokerOptions, WsmanBroker};
pub use certificate::CertificateFile;
pub use wsman::{WsmanAuth, WsmanClient, WsmanError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::codec::EncodedScript;
use crate::vault::Credential;

/// Default WinRM port over HTTPS
pub const DEFAULT_HTTPS_PORT: u16 = 5986;

/// Default WinRM port over plain HTTP
pub const DEFAULT_HTTP_PORT: u16 = 5985;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while opening or using a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session could not be established.
    #[error("Failed to establish session to {host}: {message}")]
    Establishment {
        /// Host that refused or could not be reached
        host: String,
        /// Error message
        message: String,
    },

    /// The session was established but running the script failed.
    #[error("Remote execution on {host} failed: {message}")]
    Execution {
        /// Host the script ran on
        host: String,
        /// Error message
        message: String,
    },
}

impl SessionError {
    /// Create an establishment error.
    pub fn establishment(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Establishment {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn execution(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// WinRM transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// HTTPS on 5986
    #[default]
    Https,
    /// Plain HTTP on 5985
    Http,
}

impl Transport {
    /// Pick the transport from a `use_ssl` flag.
    pub fn from_ssl(use_ssl: bool) -> Self {
        if use_ssl {
            Transport::Https
        } else {
            Transport::Http
        }
    }

    /// Default port for this transport.
    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Https => DEFAULT_HTTPS_PORT,
            Transport::Http => DEFAULT_HTTP_PORT,
        }
    }

    /// URL scheme.
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Https => "https",
            Transport::Http => "http",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Address of a WinRM listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// Listener port
    pub port: u16,
    /// Transport
    pub transport: Transport,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
        }
    }

    /// Create an endpoint on the transport's default port.
    pub fn with_default_port(host: impl Into<String>, transport: Transport) -> Self {
        Self::new(host, transport.default_port(), transport)
    }

    /// WS-Management URL of the listener.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}/wsman",
            self.transport.scheme(),
            self.host,
            self.port
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Undecoded output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// Bytes written to stdout
    pub stdout: Vec<u8>,
    /// Bytes written to stderr
    pub stderr: Vec<u8>,
    /// Process exit code
    pub exit_code: i32,
}

/// An established session that can run encoded scripts.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Host the scripts ultimately run on.
    fn host(&self) -> &str;

    /// Run a wrapper script and collect its raw output.
    ///
    /// When `timeout` elapses the remote command is terminated and its
    /// shell released before [`SessionError::Execution`] is returned.
    async fn execute(
        &self,
        script: &EncodedScript,
        timeout: Option<Duration>,
    ) -> SessionResult<RawOutput>;

    /// Release the session.
    async fn close(&self) -> SessionResult<()>;
}

/// Opens sessions to target hosts.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Open a session straight to `target`.
    async fn open_direct(
        &self,
        target: &Endpoint,
        credential: &Credential,
    ) -> SessionResult<Box<dyn RemoteSession>>;

    /// Open a session to `target_host` through `jump`.
    ///
    /// `jump_certificate` authenticates the handler to the jump host;
    /// `target_credential` is forwarded from the jump host to the target.
    async fn open_via_jump_host(
        &self,
        jump: &Endpoint,
        jump_certificate: &Credential,
        target_host: &str,
        target_credential: &Credential,
    ) -> SessionResult<Box<dyn RemoteSession>>;
}
