//! The command action: one request, one attempt, one result.
//!
//! ```text
//! Created ──> CredentialsResolved ──> SessionEstablished ──> Executed ──> Succeeded
//!    │                 │                       │                 │
//!    └─────────────────┴───────────────────────┴─────────────────┴──────> Failed
//! ```
//!
//! Configuration for the tenant and any jump host is validated in
//! `Created`, before the vault is asked for anything. Every failure is
//! folded into a failed [`ExecutionResult`]; [`CommandAction::run`] never
//! returns an error.

mod error;
mod request;
mod result;

pub use error::{ActionError, ErrorKind};
pub use request::{ActionParameters, ExecutionRequest, DEFAULT_CUSTOMER};
pub use result::ExecutionResult;

use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::codec::{self, EncodedScript};
use crate::config::{Config, JumpRoute};
use crate::session::{
    BrokerOptions, Endpoint, RawOutput, RemoteSession, SessionBroker, WsmanBroker,
};
use crate::vault::{Credential, CredentialResolver, VaultClient, VaultEndpoint, VaultError};

/// Lifecycle state of a command action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionState {
    /// Request accepted, nothing resolved yet
    Created,
    /// Target credential resolved
    CredentialsResolved,
    /// Session open to the target
    SessionEstablished,
    /// Script ran, output not yet decoded
    Executed,
    /// Output decoded
    Succeeded,
    /// Terminal failure
    Failed,
}

impl ActionState {
    /// Whether the action has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Succeeded | ActionState::Failed)
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionState::Created => "created",
            ActionState::CredentialsResolved => "credentials_resolved",
            ActionState::SessionEstablished => "session_established",
            ActionState::Executed => "executed",
            ActionState::Succeeded => "succeeded",
            ActionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Collaborators shared by all actions.
#[derive(Clone)]
pub struct ActionContext {
    /// Read-only configuration
    pub config: Arc<Config>,
    /// Credential lookups
    pub vault: Arc<dyn CredentialResolver>,
    /// Session factory
    pub broker: Arc<dyn SessionBroker>,
}

impl ActionContext {
    /// Create a context from explicit collaborators.
    pub fn new(
        config: Arc<Config>,
        vault: Arc<dyn CredentialResolver>,
        broker: Arc<dyn SessionBroker>,
    ) -> Self {
        Self {
            config,
            vault,
            broker,
        }
    }

    /// Create a context with the HTTP vault client and WinRM broker.
    pub fn from_config(config: Arc<Config>) -> Result<Self, VaultError> {
        let vault = VaultClient::new()?;
        let broker = WsmanBroker::new(BrokerOptions {
            timeout: config.handler.timeout(),
            verify_tls: config.handler.verify_tls,
            cert_dir: config.handler.cert_dir.clone(),
        });

        Ok(Self::new(config, Arc::new(vault), Arc::new(broker)))
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything validated in `Created`.
struct Route {
    vault: VaultEndpoint,
    target: Endpoint,
    jump: Option<JumpRoute>,
}

/// Runs one execution request to a terminal state.
pub struct CommandAction {
    request: ExecutionRequest,
    context: ActionContext,
    state: ActionState,
}

impl CommandAction {
    /// Create an action in `Created`.
    pub fn new(request: ExecutionRequest, context: ActionContext) -> Self {
        Self {
            request,
            context,
            state: ActionState::Created,
        }
    }

    /// Current state.
    pub fn state(&self) -> ActionState {
        self.state
    }

    /// The request being run.
    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    /// Run the action to completion.
    pub async fn run(&mut self) -> ExecutionResult {
        let span = info_span!(
            "action",
            action = self.request.num,
            host = %self.request.host,
            interpreter = %self.request.interpreter,
            jump_host = self.request.jump_host.as_deref().unwrap_or(""),
            status = tracing::field::Empty,
        );

        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> ExecutionResult {
        let num = self.request.num;

        match self.drive().await {
            Ok(result) => {
                self.state = ActionState::Succeeded;
                tracing::Span::current().record("status", "succeeded");
                info!(
                    action = num,
                    host = %self.request.host,
                    exit_code = ?result.exit_code,
                    "Action succeeded"
                );
                result
            }
            Err(e) => {
                self.state = ActionState::Failed;
                tracing::Span::current().record("status", "failed");
                ExecutionResult::failed(num, &self.request.host, &e)
            }
        }
    }

    async fn drive(&mut self) -> Result<ExecutionResult, ActionError> {
        let route = self.route()?;

        let target_credential = self
            .resolve(&route.vault, &self.request.resource, &self.request.account)
            .await
            .inspect_err(|e| {
                error!(
                    action = self.request.num,
                    host = %self.request.host,
                    kind = %e.kind(),
                    error = %e,
                    "Failed to resolve target credential"
                )
            })?;
        self.state = ActionState::CredentialsResolved;

        let session = self.open_session(&route, &target_credential).await?;
        self.state = ActionState::SessionEstablished;

        let script = codec::encode(&self.request.script, self.request.interpreter);
        let outcome = self.execute(session.as_ref(), &script).await;

        if let Err(e) = session.close().await {
            warn!(action = self.request.num, host = %session.host(), error = %e, "Failed to close session");
        }

        let raw = outcome.inspect_err(|e| {
            error!(
                action = self.request.num,
                host = %self.request.host,
                error = %e,
                "Remote execution failed"
            )
        })?;
        self.state = ActionState::Executed;

        let decoded = codec::decode(&raw.stdout).map_err(|e| {
            let e = ActionError::from(e);
            error!(
                action = self.request.num,
                host = %self.request.host,
                error = %e,
                "Failed to decode remote output"
            );
            e
        })?;

        Ok(ExecutionResult::succeeded(
            self.request.num,
            &self.request.host,
            &raw,
            decoded,
        ))
    }

    /// Validate request fields, tenant and jump host configuration.
    fn route(&self) -> Result<Route, ActionError> {
        let request = &self.request;
        let config = &self.context.config;

        let fail = |message: String| {
            error!(action = request.num, host = %request.host, error = %message, "Configuration missing");
            ActionError::ConfigurationMissing(message)
        };

        for (name, value) in [
            ("Hostname", &request.host),
            ("PMPResource", &request.resource),
            ("ServiceAccount", &request.account),
        ] {
            if value.trim().is_empty() {
                return Err(fail(format!("Request parameter '{}' is empty", name)));
            }
        }

        let vault = config
            .vault_endpoint(&request.customer)
            .map_err(|e| fail(e.to_string()))?;

        let jump = match &request.jump_host {
            Some(name) => Some(config.jump_route(name).map_err(|e| {
                fail(format!("Jumpserver config for vault is missing: {}", e))
            })?),
            None => None,
        };

        let transport = request
            .transport
            .unwrap_or_else(|| config.handler.transport());
        let port = request.port.unwrap_or_else(|| transport.default_port());

        Ok(Route {
            vault,
            target: Endpoint::new(&request.host, port, transport),
            jump,
        })
    }

    async fn resolve(
        &self,
        endpoint: &VaultEndpoint,
        resource: &str,
        account: &str,
    ) -> Result<Credential, ActionError> {
        let credential = self
            .context
            .vault
            .resolve(endpoint, resource, account)
            .await?;
        debug!(resource = %resource, account = %account, kind = %credential.kind(), "Credential resolved");
        Ok(credential)
    }

    async fn open_session(
        &self,
        route: &Route,
        target_credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>, ActionError> {
        let num = self.request.num;
        let broker = &self.context.broker;

        let Some(jump) = &route.jump else {
            return broker
                .open_direct(&route.target, target_credential)
                .await
                .map_err(|e| {
                    error!(action = num, host = %route.target.host, error = %e, "Session establishment failed");
                    ActionError::from(e)
                });
        };

        let jump_certificate = self
            .resolve(&route.vault, &jump.vault_resource, &jump.vault_account)
            .await
            .map_err(|e| {
                let e = e.context(format_args!("Jump host '{}'", jump.name));
                error!(
                    action = num,
                    host = %self.request.host,
                    jump_host = %jump.name,
                    kind = %e.kind(),
                    error = %e,
                    "Failed to resolve jump host certificate"
                );
                e
            })?;

        let jump_endpoint = Endpoint::new(&jump.hostname, jump.port, jump.transport);

        broker
            .open_via_jump_host(
                &jump_endpoint,
                &jump_certificate,
                &route.target.host,
                target_credential,
            )
            .await
            .map_err(|e| {
                error!(
                    action = num,
                    host = %route.target.host,
                    jump_host = %jump.name,
                    error = %e,
                    "Session establishment via jump host failed"
                );
                ActionError::from(e)
            })
    }

    async fn execute(
        &self,
        session: &dyn RemoteSession,
        script: &EncodedScript,
    ) -> Result<RawOutput, ActionError> {
        debug!(
            action = self.request.num,
            host = %session.host(),
            timeout = ?self.request.timeout,
            "Executing script"
        );

        // the session enforces the timeout and releases the shell on expiry
        let raw = session.execute(script, self.request.timeout).await?;
        Ok(raw)
    }
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAction")
            .field("request", &self.request)
            .field("state", &self.state)
            .finish()
    }
}
