//! Inbound execution requests.

use serde::Deserialize;
use std::time::Duration;

use crate::codec::InterpreterKind;
use crate::session::Transport;

/// Customer used when a request carries no `CustomerID`
pub const DEFAULT_CUSTOMER: &str = "default";

fn default_customer() -> String {
    DEFAULT_CUSTOMER.to_string()
}

/// Request parameters as delivered by the dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionParameters {
    /// Target host
    #[serde(rename = "Hostname")]
    pub hostname: String,

    /// Script body
    #[serde(rename = "Command")]
    pub command: String,

    /// Tenant whose vault holds the credentials
    #[serde(rename = "CustomerID", default = "default_customer")]
    pub customer_id: String,

    /// Vault resource name of the target account
    #[serde(rename = "PMPResource", default)]
    pub resource: String,

    /// Vault account name
    #[serde(rename = "ServiceAccount", default)]
    pub account: String,

    /// Jump host to route through
    #[serde(rename = "RemoteExecutionServer", default)]
    pub remote_execution_server: Option<String>,

    /// WinRM port override
    #[serde(rename = "Port", default)]
    pub port: Option<u16>,

    /// Execution timeout in seconds
    #[serde(rename = "Timeout", default)]
    pub timeout: Option<u64>,
}

/// One command to run on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Sequence number assigned by the dispatcher
    pub num: u64,
    /// Target host
    pub host: String,
    /// Port, defaulting by transport
    pub port: Option<u16>,
    /// Transport, defaulting to the handler's `use_ssl`
    pub transport: Option<Transport>,
    /// Script body
    pub script: String,
    /// Interpreter for the script
    pub interpreter: InterpreterKind,
    /// Jump host name
    pub jump_host: Option<String>,
    /// Vault resource name
    pub resource: String,
    /// Vault account name
    pub account: String,
    /// Tenant identifier
    pub customer: String,
    /// Execution timeout
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// Create a request with default tenant and no jump host.
    pub fn new(
        num: u64,
        host: impl Into<String>,
        script: impl Into<String>,
        interpreter: InterpreterKind,
    ) -> Self {
        Self {
            num,
            host: host.into(),
            port: None,
            transport: None,
            script: script.into(),
            interpreter,
            jump_host: None,
            resource: String::new(),
            account: String::new(),
            customer: default_customer(),
            timeout: None,
        }
    }

    /// Build a request from dispatcher parameters.
    pub fn from_parameters(num: u64, params: ActionParameters, interpreter: InterpreterKind) -> Self {
        Self {
            num,
            host: params.hostname,
            port: params.port,
            transport: None,
            script: params.command,
            interpreter,
            jump_host: params
                .remote_execution_server
                .filter(|name| !name.trim().is_empty()),
            resource: params.resource,
            account: params.account,
            customer: params.customer_id,
            timeout: params.timeout.map(Duration::from_secs),
        }
    }

    /// Set the vault resource and account.
    pub fn with_credentials(mut self, resource: impl Into<String>, account: impl Into<String>) -> Self {
        self.resource = resource.into();
        self.account = account.into();
        self
    }

    /// Set the tenant.
    pub fn with_customer(mut self, customer: impl Into<String>) -> Self {
        self.customer = customer.into();
        self
    }

    /// Route through a jump host.
    pub fn with_jump_host(mut self, jump_host: impl Into<String>) -> Self {
        self.jump_host = Some(jump_host.into());
        self
    }

    /// Override port and transport.
    pub fn with_endpoint(mut self, port: u16, transport: Transport) -> Self {
        self.port = Some(port);
        self.transport = Some(transport);
        self
    }

    /// Bound the execution step.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
