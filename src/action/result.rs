//! Execution results.

use serde::{Deserialize, Serialize};

use super::error::{ActionError, ErrorKind};
use crate::codec::DecodedOutput;
use crate::session::RawOutput;

/// Outcome of one command action.
///
/// `success` reports whether the handler managed to run the script; the
/// script's own exit code is reported separately and not interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Sequence number of the request
    pub num: u64,
    /// Target host
    pub host: String,
    /// Whether the script ran
    pub success: bool,
    /// Why the action failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Error kind of a failed action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Remote exit code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Decoded stdout lines
    #[serde(default)]
    pub stdout: String,
    /// Decoded stderr lines
    #[serde(default)]
    pub stderr: String,
    /// Tagged stdout as received
    #[serde(default)]
    pub raw_stdout: String,
    /// Stderr as received
    #[serde(default)]
    pub raw_stderr: String,
}

impl ExecutionResult {
    /// Result of a script that ran.
    pub fn succeeded(num: u64, host: impl Into<String>, raw: &RawOutput, decoded: DecodedOutput) -> Self {
        Self {
            num,
            host: host.into(),
            success: true,
            status_message: None,
            error_kind: None,
            exit_code: Some(raw.exit_code),
            stdout: decoded.stdout,
            stderr: decoded.stderr,
            raw_stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            raw_stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        }
    }

    /// Result of an action that failed before or during execution.
    pub fn failed(num: u64, host: impl Into<String>, error: &ActionError) -> Self {
        Self {
            num,
            host: host.into(),
            success: false,
            status_message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            raw_stdout: String::new(),
            raw_stderr: String::new(),
        }
    }
}
