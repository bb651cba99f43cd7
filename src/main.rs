//! winrm-actionhandler: run scripts on Windows hosts over WinRM.
//!
//! This is the main entry point for the command-line front end.

mod cli;

use anyhow::{Context, Result};
use cli::{BatchArgs, Cli, Commands, ExecArgs};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use winrm_actionhandler::action::ActionContext;
use winrm_actionhandler::config::Config;
use winrm_actionhandler::error::Error;
use winrm_actionhandler::pool::{ActionPool, ShutdownCoordinator, TaskRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity(), cli.json_logs);

    // Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(parallel_tasks) = cli.parallel_tasks {
        config.handler.parallel_tasks = parallel_tasks;
    }
    let config = Arc::new(config);

    let context =
        ActionContext::from_config(Arc::clone(&config)).context("Failed to create vault client")?;
    let shutdown = ShutdownCoordinator::new();
    let pool = ActionPool::new(context, config.handler.parallel_tasks, shutdown.clone());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.shutdown();
        }
    });

    let exit_code = match &cli.command {
        Commands::Exec(args) => run_exec(args, &pool, &config).await?,
        Commands::Batch(args) => run_batch(args, &pool, &config).await?,
    };

    shutdown.shutdown();
    shutdown.drain(config.handler.shutdown_grace()).await;

    std::process::exit(exit_code);
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8, json: bool) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // results go to stdout, logs to stderr
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(verbosity >= 3)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .init();
    }
}

/// Wait for Ctrl-C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run a single request and print its result.
async fn run_exec(args: &ExecArgs, pool: &ActionPool, config: &Config) -> Result<i32> {
    let request = args.to_request(config.handler.transport());
    let pending = pool.submit(request)?;
    let result = pool
        .collect(vec![pending], config.handler.shutdown_grace())
        .await
        .into_iter()
        .next()
        .context("Action produced no result")?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.success { 0 } else { 1 })
}

/// Run JSON-lines requests and print one JSON result per line.
async fn run_batch(args: &BatchArgs, pool: &ActionPool, config: &Config) -> Result<i32> {
    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let shutdown = pool.shutdown_coordinator();
    let mut lines = BufReader::new(input).lines();
    let mut pending = Vec::new();
    let mut failures = 0usize;
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no further requests are read");
                break;
            }
        };
        let Some(line) = line else { break };
        line_no += 1;

        if line.trim().is_empty() {
            continue;
        }

        let task: TaskRequest = match serde_json::from_str(&line) {
            Ok(task) => task,
            Err(e) => {
                let err = Error::invalid_request(line_no, e.to_string());
                error!(error = %err, "Skipping request");
                failures += 1;
                continue;
            }
        };

        match pool.submit(task.into_request(line_no as u64)) {
            Ok(action) => pending.push(action),
            Err(e) => {
                error!(line = line_no, error = %Error::from(e), "Request not started");
                failures += 1;
            }
        }
    }

    let results = pool.collect(pending, config.handler.shutdown_grace()).await;

    let mut stdout = tokio::io::stdout();
    for result in results {
        if !result.success {
            failures += 1;
        }
        let mut json = serde_json::to_vec(&result)?;
        json.push(b'\n');
        stdout.write_all(&json).await?;
    }
    stdout.flush().await?;

    info!(failures, "Batch finished");
    Ok(if failures == 0 { 0 } else { 1 })
}
