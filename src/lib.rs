//! # winrm-actionhandler
//!
//! Runs `cmd.exe` and PowerShell scripts on remote Windows hosts over WinRM.
//! Credentials are never configured per host: every request names a vault
//! resource and account, and the secret is fetched from the tenant's
//! password vault at execution time. Hosts that are not reachable from the
//! handler are served through a jump host, authenticated with a client
//! certificate that is itself stored in the vault.
//!
//! ## Architecture Overview
//!
//! ```text
//!   dispatcher / CLI
//!          |
//!          v
//! +------------------+      +-------------------+
//! |   ActionPool     |----->|  CommandAction    |  one per request
//! | (bounded tasks)  |      |  (state machine)  |
//! +------------------+      +-------------------+
//!                              |      |       |
//!               +--------------+      |       +---------------+
//!               v                     v                       v
//!      +----------------+   +------------------+   +------------------+
//!      |  vault         |   |  session         |   |  codec           |
//!      |  (credentials) |   |  (WinRM, direct  |   |  (wrapper script |
//!      |                |   |   or jump host)  |   |   + tagged output|
//!      +----------------+   +------------------+   +------------------+
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use winrm_actionhandler::prelude::*;
//!
//! let config = Arc::new(Config::load(None)?);
//! let context = ActionContext::from_config(config)?;
//!
//! let request = ExecutionRequest::new(1, "web01", "echo hi", InterpreterKind::Cmd)
//!     .with_credentials("web01", "svc_autopilot");
//!
//! let result = CommandAction::new(request, context).run().await;
//! assert_eq!(result.stdout, "hi");
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod action;
pub mod codec;
pub mod config;
pub mod error;
pub mod pool;
pub mod session;
pub mod vault;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::{
        ActionContext, ActionError, ActionState, CommandAction, ErrorKind, ExecutionRequest,
        ExecutionResult,
    };
    pub use crate::codec::{decode, encode, DecodedOutput, EncodedScript, InterpreterKind};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::pool::{ActionPool, Capability, ShutdownCoordinator, TaskRequest};
    pub use crate::session::{
        Endpoint, RawOutput, RemoteSession, SessionBroker, Transport, WsmanBroker,
    };
    pub use crate::vault::{Credential, CredentialResolver, VaultClient, VaultEndpoint};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
