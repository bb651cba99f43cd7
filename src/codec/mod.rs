//! Script codec for remote cmd.exe and PowerShell execution.
//!
//! A user script never travels to the remote host as-is. It is encoded as
//! UTF-16LE, base64'd, and embedded in a fixed PowerShell *wrapper script*
//! that:
//!
//! 1. widens the console to [`CONSOLE_COLUMNS`] so captured lines are not
//!    hard-wrapped by the remote console host,
//! 2. writes the decoded payload to a temporary `.bat` or `.ps1`-style file,
//! 3. runs it with stderr folded into stdout (`2>&1`),
//! 4. tags every output line as `<psout>` or `<pserr>` (an `ErrorRecord`),
//!    with the line content inside a CDATA section,
//! 5. deletes the temporary file and exits with the interpreter's exit code.
//!
//! The tagged stream is turned back into separate stdout/stderr text by
//! [`decode`].
//!
//! # Example
//!
//! ```rust
//! use winrm_actionhandler::codec::{decode, encode, InterpreterKind};
//!
//! let script = encode("echo hi", InterpreterKind::Cmd);
//! assert!(script.wrapper().contains("cmd.exe /q /c"));
//!
//! let output = decode(b"<psout><![CDATA[hi]]></psout>\r\n").unwrap();
//! assert_eq!(output.stdout, "hi");
//! ```
//!
//! Both directions are pure functions and safe to call from any number of
//! concurrent actions.

mod tagged;

pub use tagged::{decode, DecodedOutput};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Console width forced on the remote host before the payload runs.
pub const CONSOLE_COLUMNS: u16 = 120;

/// Element name for lines written to the success stream.
pub const STDOUT_TAG: &str = "psout";

/// Element name for lines that were PowerShell `ErrorRecord`s.
pub const STDERR_TAG: &str = "pserr";

/// Errors produced by the codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The captured stream was not produced by one of our wrapper scripts.
    #[error("Malformed tagged output at byte {offset}: {reason}")]
    MalformedOutput {
        /// Byte offset into the raw output
        offset: usize,
        /// What the decoder expected
        reason: String,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Interpreter that runs the user script on the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterKind {
    /// `cmd.exe` batch script
    #[default]
    Cmd,
    /// PowerShell script
    PowerShell,
}

impl InterpreterKind {
    /// Executable name used in log lines and descriptions.
    pub fn executable(&self) -> &'static str {
        match self {
            InterpreterKind::Cmd => "cmd.exe",
            InterpreterKind::PowerShell => "powershell.exe",
        }
    }
}

impl fmt::Display for InterpreterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpreterKind::Cmd => write!(f, "cmd"),
            InterpreterKind::PowerShell => write!(f, "powershell"),
        }
    }
}

impl FromStr for InterpreterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cmd" | "cmd.exe" => Ok(InterpreterKind::Cmd),
            "ps" | "powershell" | "powershell.exe" => Ok(InterpreterKind::PowerShell),
            _ => Err(format!("Unknown interpreter: {}", s)),
        }
    }
}

/// A wrapper script ready to be shipped to the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedScript {
    wrapper: String,
    interpreter: InterpreterKind,
}

impl EncodedScript {
    /// The PowerShell wrapper text.
    pub fn wrapper(&self) -> &str {
        &self.wrapper
    }

    /// The interpreter the embedded payload is run with.
    pub fn interpreter(&self) -> InterpreterKind {
        self.interpreter
    }

    /// Command line that runs the wrapper on the remote host.
    pub fn command_line(&self) -> String {
        powershell_command(&self.wrapper)
    }
}

/// Encode a user script into a wrapper script for `interpreter`.
///
/// The output depends only on the inputs; calling this twice with the same
/// arguments yields byte-identical wrappers.
pub fn encode(body: &str, interpreter: InterpreterKind) -> EncodedScript {
    let payload = encode_utf16_base64(body);
    let wrapper = match interpreter {
        InterpreterKind::Cmd => cmd_wrapper(&payload),
        InterpreterKind::PowerShell => powershell_wrapper(&payload),
    };

    EncodedScript {
        wrapper,
        interpreter,
    }
}

/// Base64 of the UTF-16LE encoding of `text`, the form PowerShell's
/// `-EncodedCommand` and `[Text.Encoding]::Unicode` expect.
pub fn encode_utf16_base64(text: &str) -> String {
    let unicode: Vec<u8> = text.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    BASE64_STANDARD.encode(unicode)
}

/// Build a non-interactive `powershell.exe -EncodedCommand` invocation.
pub fn powershell_command(script: &str) -> String {
    format!(
        "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
        encode_utf16_base64(script)
    )
}

/// Pipeline stage that tags each object with its stream and escapes `]]>`.
fn tag_stage() -> String {
    format!(
        "%{{$e=@(\"{STDOUT_TAG}\",\"{STDERR_TAG}\")[[byte]($_.GetType().Name -eq \"ErrorRecord\")];\
$l=\"$_\" -replace '\\]\\]>',']]]]><![CDATA[>';\
return \"<$e><![CDATA[$l]]></$e>\"}}"
    )
}

fn cmd_wrapper(payload: &str) -> String {
    format!(
        "mode.com con: cols={cols} | Out-Null
$t = [IO.Path]::GetTempFileName() | ren -NewName {{ $_ -replace 'tmp$', 'bat' }} -PassThru
[System.Text.Encoding]::Unicode.GetString([System.Convert]::FromBase64String(\"{payload}\")) | out-file -encoding \"ASCII\" $t
& cmd.exe /q /c $t 2>&1 | {tag}
rm $t
exit $LastExitCode
",
        cols = CONSOLE_COLUMNS,
        payload = payload,
        tag = tag_stage()
    )
}

fn powershell_wrapper(payload: &str) -> String {
    format!(
        "mode.com con: cols={cols} | Out-Null
$t = [IO.Path]::GetTempFileName()
[System.Text.Encoding]::Unicode.GetString([System.Convert]::FromBase64String(\"{payload}\")) >$t
gc $t | powershell - 2>&1 | {tag}
rm $t
exit $LastExitCode
",
        cols = CONSOLE_COLUMNS,
        payload = payload,
        tag = tag_stage()
    )
}
