//! Command-line interface for the action handler.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use winrm_actionhandler::action::{ExecutionRequest, DEFAULT_CUSTOMER};
use winrm_actionhandler::codec::InterpreterKind;
use winrm_actionhandler::session::Transport;

/// Run cmd.exe and PowerShell scripts on Windows hosts over WinRM
#[derive(Parser, Debug, Clone)]
#[command(name = "winrm-actionhandler")]
#[command(version)]
#[command(about = "Run commands on Windows hosts over WinRM with vault-brokered credentials", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "WINRM_ACTIONHANDLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Override the number of concurrent actions
    #[arg(short = 'j', long, global = true)]
    pub parallel_tasks: Option<usize>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run one script on one host
    Exec(ExecArgs),

    /// Run JSON-lines task requests from a file or stdin
    Batch(BatchArgs),
}

/// Arguments for the exec command
#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    /// Target host
    #[arg(short = 'H', long)]
    pub host: String,

    /// Script body
    pub script: String,

    /// Interpreter (cmd or powershell)
    #[arg(short = 'I', long, default_value = "cmd")]
    pub interpreter: InterpreterKind,

    /// Vault resource holding the target account
    #[arg(short = 'r', long)]
    pub resource: String,

    /// Vault account name
    #[arg(short = 'a', long)]
    pub account: String,

    /// Tenant whose vault is queried
    #[arg(long, default_value = DEFAULT_CUSTOMER)]
    pub customer: String,

    /// Jump host to route through
    #[arg(short = 'J', long)]
    pub jump_host: Option<String>,

    /// WinRM port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Use plain HTTP instead of HTTPS
    #[arg(long)]
    pub http: bool,

    /// Execution timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

impl ExecArgs {
    /// Build the execution request.
    pub fn to_request(&self, default_transport: Transport) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(1, &self.host, &self.script, self.interpreter)
            .with_credentials(&self.resource, &self.account)
            .with_customer(&self.customer);

        if let Some(jump_host) = &self.jump_host {
            request = request.with_jump_host(jump_host);
        }

        let transport = if self.http {
            Transport::Http
        } else {
            default_transport
        };
        if self.http || self.port.is_some() {
            request = request.with_endpoint(self.port.unwrap_or_else(|| transport.default_port()), transport);
        }

        if let Some(secs) = self.timeout {
            request = request.with_timeout(Duration::from_secs(secs));
        }

        request
    }
}

/// Arguments for the batch command
#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Input file with one JSON request per line (defaults to stdin)
    pub input: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}
