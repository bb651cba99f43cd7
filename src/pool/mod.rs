//! Capability dispatch and bounded concurrent execution.
//!
//! Requests arrive tagged with a [`Capability`] that picks the interpreter.
//! The [`ActionPool`] runs each as its own tokio task, at most
//! `parallel_tasks` at a time, and the [`ShutdownCoordinator`] stops intake
//! and waits for in-flight actions when the process is asked to stop.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::action::{
    ActionContext, ActionError, ActionParameters, CommandAction, ExecutionRequest, ExecutionResult,
};
use crate::codec::InterpreterKind;

/// Default number of concurrent actions
pub const DEFAULT_PARALLEL_TASKS: usize = 5;

/// Errors raised by the pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Shutdown has started; no new actions are accepted.
    #[error("Action pool is shutting down")]
    ShuttingDown,

    /// An action task panicked or was aborted.
    #[error("Action task failed: {0}")]
    TaskFailed(String),

    /// The capability tag is not known.
    #[error("Unknown capability '{0}'")]
    UnknownCapability(String),
}

/// Request types the handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Run a cmd.exe batch script
    ExecuteCommand,
    /// Run a PowerShell script
    ExecutePowershell,
}

impl Capability {
    /// All capabilities, in registration order.
    pub const ALL: [Capability; 2] = [Capability::ExecuteCommand, Capability::ExecutePowershell];

    /// Interpreter used for this capability.
    pub fn interpreter(&self) -> InterpreterKind {
        match self {
            Capability::ExecuteCommand => InterpreterKind::Cmd,
            Capability::ExecutePowershell => InterpreterKind::PowerShell,
        }
    }

    /// Tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ExecuteCommand => "ExecuteCommand",
            Capability::ExecutePowershell => "ExecutePowershell",
        }
    }

    /// Build an execution request from dispatcher parameters.
    pub fn build_request(&self, num: u64, params: ActionParameters) -> ExecutionRequest {
        ExecutionRequest::from_parameters(num, params, self.interpreter())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|capability| capability.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PoolError::UnknownCapability(s.to_string()))
    }
}

/// A dispatcher request: capability tag plus action parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    /// Requested capability
    #[serde(rename = "Capability")]
    pub capability: Capability,

    /// Action parameters
    #[serde(flatten)]
    pub params: ActionParameters,
}

impl TaskRequest {
    /// Turn into an execution request with sequence number `num`.
    pub fn into_request(self, num: u64) -> ExecutionRequest {
        self.capability.build_request(num, self.params)
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Coordinates graceful shutdown of the pool.
///
/// Cloned handles share state. `shutdown` is idempotent.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting new actions.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!(in_flight = self.tracker.len(), "Initiating graceful shutdown");
        }
        self.token.cancel();
        self.tracker.close();
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until shutdown starts.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Number of actions still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for in-flight actions to finish.
    ///
    /// Returns `true` if all finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                debug!("All in-flight actions finished");
                true
            }
            Err(_) => {
                warn!(
                    in_flight = self.tracker.len(),
                    grace_secs = grace.as_secs(),
                    "Shutdown grace period elapsed with actions still running"
                );
                false
            }
        }
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A submitted action.
///
/// Wraps the task handle together with what is needed to report the action
/// if it never finishes.
#[derive(Debug)]
pub struct PendingAction {
    num: u64,
    host: String,
    handle: JoinHandle<ExecutionResult>,
}

impl PendingAction {
    /// Sequence number of the request.
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Wait for the action to finish.
    pub async fn wait(self) -> Result<ExecutionResult, PoolError> {
        self.handle
            .await
            .map_err(|e| PoolError::TaskFailed(e.to_string()))
    }

    fn finished(self, joined: Result<ExecutionResult, tokio::task::JoinError>) -> ExecutionResult {
        joined.unwrap_or_else(|e| {
            error!(action = self.num, host = %self.host, error = %e, "Action task failed");
            ExecutionResult::failed(
                self.num,
                &self.host,
                &ActionError::Aborted(format!("Action task failed: {}", e)),
            )
        })
    }

    fn abort(self, reason: &str) -> ExecutionResult {
        self.handle.abort();
        warn!(action = self.num, host = %self.host, "Action aborted: {}", reason);
        ExecutionResult::failed(self.num, &self.host, &ActionError::Aborted(reason.to_string()))
    }
}

/// Runs command actions concurrently with a fixed upper bound.
#[derive(Debug, Clone)]
pub struct ActionPool {
    context: ActionContext,
    semaphore: Arc<Semaphore>,
    shutdown: ShutdownCoordinator,
}

impl ActionPool {
    /// Create a pool running at most `parallel_tasks` actions at once.
    pub fn new(context: ActionContext, parallel_tasks: usize, shutdown: ShutdownCoordinator) -> Self {
        Self {
            context,
            semaphore: Arc::new(Semaphore::new(parallel_tasks.max(1))),
            shutdown,
        }
    }

    /// The pool's shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Number of free execution slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Start an action.
    ///
    /// The action waits for a free slot inside its task, so this returns
    /// immediately. An action still waiting for a slot when shutdown starts
    /// never opens a session and finishes as [`ErrorKind::Aborted`].
    ///
    /// [`ErrorKind::Aborted`]: crate::action::ErrorKind::Aborted
    pub fn submit(&self, request: ExecutionRequest) -> Result<PendingAction, PoolError> {
        if self.shutdown.is_shutting_down() {
            warn!(action = request.num, host = %request.host, "Rejecting action during shutdown");
            return Err(PoolError::ShuttingDown);
        }

        let num = request.num;
        let host = request.host.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let context = self.context.clone();
        let shutdown = self.shutdown.clone();

        let handle = self.shutdown.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                // the semaphore is never closed
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            let Some(_permit) = permit.filter(|_| !shutdown.is_shutting_down()) else {
                debug!(action = request.num, host = %request.host, "Shutdown before a slot was free");
                return ExecutionResult::failed(
                    request.num,
                    &request.host,
                    &ActionError::Aborted("Handler shut down before the action started".to_string()),
                );
            };

            CommandAction::new(request, context).run().await
        });

        Ok(PendingAction { num, host, handle })
    }

    /// Wait for `pending` actions and return their results in order.
    ///
    /// Unbounded until shutdown starts; from then on the remaining actions
    /// get `grace` to finish, and any still running are aborted and
    /// reported as [`ErrorKind::Aborted`].
    ///
    /// [`ErrorKind::Aborted`]: crate::action::ErrorKind::Aborted
    pub async fn collect(&self, pending: Vec<PendingAction>, grace: Duration) -> Vec<ExecutionResult> {
        let grace_elapsed = async {
            self.shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(grace_elapsed);

        let mut expired = false;
        let mut results = Vec::with_capacity(pending.len());

        for mut action in pending {
            if !expired {
                let joined = tokio::select! {
                    joined = &mut action.handle => Some(joined),
                    _ = &mut grace_elapsed => None,
                };

                match joined {
                    Some(joined) => {
                        results.push(action.finished(joined));
                        continue;
                    }
                    None => {
                        warn!(grace_secs = grace.as_secs_f64(), "Shutdown grace period elapsed");
                        expired = true;
                    }
                }
            }

            match (&mut action.handle).now_or_never() {
                Some(joined) => results.push(action.finished(joined)),
                None => results.push(action.abort("Shutdown grace period elapsed before the action finished")),
            }
        }

        results
    }

    /// Run many actions and return their results in input order.
    pub async fn run_all<I>(&self, requests: I) -> Result<Vec<ExecutionResult>, PoolError>
    where
        I: IntoIterator<Item = ExecutionRequest>,
    {
        let pending = requests
            .into_iter()
            .map(|request| self.submit(request))
            .collect::<Result<Vec<_>, _>>()?;

        futures::future::join_all(pending.into_iter().map(PendingAction::wait))
            .await
            .into_iter()
            .collect()
    }
}
