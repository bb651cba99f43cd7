//! WS-Management implementation of the session broker.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use super::certificate::CertificateFile;
use super::wsman::{WsmanAuth, WsmanClient, WsmanError};
use super::{Endpoint, RawOutput, RemoteSession, SessionBroker, SessionError, SessionResult};
use crate::codec::{encode_utf16_base64, powershell_command, EncodedScript};
use crate::vault::Credential;

/// Options shared by every session the broker opens.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Per-request timeout
    pub timeout: Duration,
    /// Verify WinRM server certificates
    pub verify_tls: bool,
    /// Directory for temporary client certificate files
    pub cert_dir: Option<PathBuf>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            verify_tls: false,
            cert_dir: None,
        }
    }
}

/// Opens WinRM sessions over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct WsmanBroker {
    options: BrokerOptions,
}

impl WsmanBroker {
    /// Create a broker.
    pub fn new(options: BrokerOptions) -> Self {
        Self { options }
    }

    fn client(&self, endpoint: &Endpoint, auth: WsmanAuth) -> SessionResult<WsmanClient> {
        WsmanClient::new(endpoint, auth, self.options.timeout, self.options.verify_tls)
            .map_err(|e| SessionError::establishment(&endpoint.host, e.to_string()))
    }

    /// Load the jump host identity through a scoped certificate file.
    fn jump_identity(&self, jump: &Endpoint, pem: &str) -> SessionResult<reqwest::Identity> {
        let file = CertificateFile::create(self.options.cert_dir.as_deref(), pem).map_err(|e| {
            SessionError::establishment(
                &jump.host,
                format!("Failed to write client certificate: {}", e),
            )
        })?;

        // the file is removed when `file` drops at the end of this scope
        file.identity()
            .map_err(|message| SessionError::establishment(&jump.host, message))
    }
}

#[async_trait]
impl SessionBroker for WsmanBroker {
    async fn open_direct(
        &self,
        target: &Endpoint,
        credential: &Credential,
    ) -> SessionResult<Box<dyn RemoteSession>> {
        let auth = match credential {
            Credential::Password { username, password } => WsmanAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            Credential::Token { token } => WsmanAuth::Bearer(token.clone()),
            Credential::Certificate { pem } => {
                let identity = reqwest::Identity::from_pem(pem.as_bytes()).map_err(|e| {
                    SessionError::establishment(
                        &target.host,
                        format!("Invalid client certificate: {}", e),
                    )
                })?;
                WsmanAuth::ClientCertificate(identity)
            }
        };

        let client = self.client(target, auth)?;
        client
            .identify()
            .await
            .map_err(|e| SessionError::establishment(&target.host, e.to_string()))?;

        info!(host = %target.host, port = target.port, auth = %credential.kind(), "Session established");

        Ok(Box::new(DirectSession { client }))
    }

    async fn open_via_jump_host(
        &self,
        jump: &Endpoint,
        jump_certificate: &Credential,
        target_host: &str,
        target_credential: &Credential,
    ) -> SessionResult<Box<dyn RemoteSession>> {
        let pem = match jump_certificate {
            Credential::Certificate { pem } => pem,
            other => {
                return Err(SessionError::establishment(
                    &jump.host,
                    format!(
                        "Jump host credential must be a client certificate, got {}",
                        other.kind()
                    ),
                ))
            }
        };

        let forwarded = match target_credential {
            Credential::Password { username, password } => ForwardedCredential {
                username: username.clone(),
                password: password.clone(),
            },
            other => {
                return Err(SessionError::establishment(
                    target_host,
                    format!(
                        "Only password credentials can be forwarded through a jump host, got {}",
                        other.kind()
                    ),
                ))
            }
        };

        let identity = self.jump_identity(jump, pem)?;
        let client = self.client(jump, WsmanAuth::ClientCertificate(identity))?;

        client
            .identify()
            .await
            .map_err(|e| SessionError::establishment(&jump.host, e.to_string()))?;
        debug!(jump_host = %jump.host, "Jump host accepted client certificate");

        let session = ProxiedSession {
            client,
            target: target_host.to_string(),
            credential: forwarded,
        };
        session.check_target().await?;

        info!(
            jump_host = %jump.host,
            host = %target_host,
            "Session established via jump host"
        );

        Ok(Box::new(session))
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Session straight to the target.
struct DirectSession {
    client: WsmanClient,
}

#[async_trait]
impl RemoteSession for DirectSession {
    fn host(&self) -> &str {
        &self.client.endpoint().host
    }

    async fn execute(
        &self,
        script: &EncodedScript,
        timeout: Option<Duration>,
    ) -> SessionResult<RawOutput> {
        self.client
            .run(&script.command_line(), None, timeout)
            .await
            .map_err(|e| SessionError::execution(self.host(), e.to_string()))
    }

    async fn close(&self) -> SessionResult<()> {
        debug!(host = %self.host(), "Closing session");
        Ok(())
    }
}

/// Password credential forwarded from the jump host to the target.
struct ForwardedCredential {
    username: String,
    password: String,
}

/// Runs on the jump host. Target, credential and the encoded wrapper
/// arrive as JSON on stdin, so none of them appear on a command line the
/// jump host can list. The wrapper is started on the target by PowerShell
/// itself and never passes through cmd.exe there.
const HOP_SCRIPT: &str = r#"$ErrorActionPreference = 'Stop'
$hop = [Console]::In.ReadToEnd() | ConvertFrom-Json
$password = ConvertTo-SecureString $hop.password -AsPlainText -Force
$credential = New-Object System.Management.Automation.PSCredential($hop.username, $password)
$session = New-PSSession -ComputerName $hop.target -Credential $credential
$rc = 0
try {
    if ($hop.command) {
        Invoke-Command -Session $session -ScriptBlock { param($c) powershell.exe -NoProfile -NonInteractive -EncodedCommand $c } -ArgumentList $hop.command
        $rc = Invoke-Command -Session $session -ScriptBlock { $LASTEXITCODE }
    }
} finally {
    Remove-PSSession -Session $session
}
exit $rc
"#;

/// Stdin document read by [`HOP_SCRIPT`].
#[derive(Serialize)]
struct HopRequest<'a> {
    target: &'a str,
    username: &'a str,
    password: &'a str,
    /// UTF-16LE base64 wrapper; absent for the session check
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
}

/// Session to the target through a jump host.
struct ProxiedSession {
    client: WsmanClient,
    target: String,
    credential: ForwardedCredential,
}

impl ProxiedSession {
    /// Command line run on the jump host; the same for every request.
    fn command_line() -> String {
        powershell_command(HOP_SCRIPT)
    }

    /// Stdin for the hop script, running `script` or only opening and
    /// closing the session.
    fn hop_input(&self, script: Option<&EncodedScript>) -> SessionResult<Vec<u8>> {
        let request = HopRequest {
            target: &self.target,
            username: &self.credential.username,
            password: &self.credential.password,
            command: script.map(|s| encode_utf16_base64(s.wrapper())),
        };

        serde_json::to_vec(&request).map_err(|e| {
            SessionError::execution(&self.target, format!("Failed to build hop request: {}", e))
        })
    }

    /// Check that the jump host can reach the target with the credential.
    async fn check_target(&self) -> SessionResult<()> {
        let input = self
            .hop_input(None)
            .map_err(|e| SessionError::establishment(&self.target, e.to_string()))?;

        let output = self
            .client
            .run(&Self::command_line(), Some(&input), None)
            .await
            .map_err(|e| SessionError::establishment(&self.target, hop_message(e)))?;

        if output.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = clixml_errors(&stderr);
            return Err(SessionError::establishment(
                &self.target,
                if reason.is_empty() {
                    format!(
                        "Jump host could not open a session to the target (exit code {})",
                        output.exit_code
                    )
                } else {
                    format!("Jump host could not open a session to the target: {}", reason)
                },
            ));
        }

        Ok(())
    }
}

fn hop_message(err: WsmanError) -> String {
    format!("Jump host failed to run the session check: {}", err)
}

#[async_trait]
impl RemoteSession for ProxiedSession {
    fn host(&self) -> &str {
        &self.target
    }

    async fn execute(
        &self,
        script: &EncodedScript,
        timeout: Option<Duration>,
    ) -> SessionResult<RawOutput> {
        let input = self.hop_input(Some(script))?;

        self.client
            .run(&Self::command_line(), Some(&input), timeout)
            .await
            .map_err(|e| SessionError::execution(&self.target, e.to_string()))
    }

    async fn close(&self) -> SessionResult<()> {
        debug!(
            jump_host = %self.client.endpoint().host,
            host = %self.target,
            "Closing proxied session"
        );
        Ok(())
    }
}

const CLIXML_HEADER: &str = "#< CLIXML";
const CLIXML_ERROR_OPEN: &str = r#"<S S="Error">"#;

/// Error text of a PowerShell stderr stream.
///
/// `powershell.exe` serializes its error stream as CLIXML when stderr is
/// not a console. Only the `<S S="Error">` records are kept; anything else
/// is returned trimmed.
fn clixml_errors(stderr: &str) -> String {
    let Some(mut rest) = stderr.trim_start().strip_prefix(CLIXML_HEADER) else {
        return stderr.trim().to_string();
    };

    let mut text = String::new();
    while let Some(start) = rest.find(CLIXML_ERROR_OPEN) {
        let after = &rest[start + CLIXML_ERROR_OPEN.len()..];
        let Some(end) = after.find("</S>") else {
            break;
        };
        text.push_str(&after[..end]);
        rest = &after[end + "</S>".len()..];
    }

    text.replace("_x000D__x000A_", "\n")
        .replace("_x000A_", "\n")
        .replace("_x000D_", "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
