//! Minimal WS-Management client for the Windows Remote Shell.
//!
//! Only the operations needed to run one command line are implemented:
//! Identify, Create shell, Command, Send, Receive, Signal and Delete. Responses
//! are inspected with plain string searches; the envelopes WinRM returns
//! for these operations are small and use fixed prefixes.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Identity};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Endpoint, RawOutput};

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const IDENTITY_NS: &str = "http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// Authorization header value for certificate mapping over HTTPS
const CERT_AUTH_PROFILE: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman/secprofile/https/mutual";

/// Fault code WinRM returns when a Receive long-poll saw no output
const FAULT_OPERATION_TIMEOUT: &str = "2150858793";

/// UTF-8 console code page
const CODEPAGE_UTF8: u32 = 65001;

const MAX_ENVELOPE_SIZE: u32 = 153600;

/// Raw stdin bytes per Send request; base64 keeps the envelope well below
/// `MAX_ENVELOPE_SIZE`
const STDIN_CHUNK_SIZE: usize = 64 * 1024;

/// Errors from the WS-Management exchange.
#[derive(Error, Debug)]
pub enum WsmanError {
    /// The HTTP request itself failed.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The listener answered with a non-success status.
    #[error("WinRM returned HTTP {status}: {message}")]
    Fault {
        /// HTTP status code
        status: u16,
        /// WSManFault code, if present
        code: Option<String>,
        /// Fault text or response body
        message: String,
    },

    /// The response did not contain what the operation requires.
    #[error("Unexpected WinRM response: {0}")]
    Protocol(String),

    /// The HTTP client could not be built.
    #[error("Invalid client configuration: {0}")]
    Client(String),

    /// The command did not finish in time; its shell was still cleaned up.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

impl WsmanError {
    fn is_operation_timeout(&self) -> bool {
        matches!(self, WsmanError::Fault { code: Some(code), .. } if code == FAULT_OPERATION_TIMEOUT)
    }
}

impl From<reqwest::Error> for WsmanError {
    fn from(err: reqwest::Error) -> Self {
        WsmanError::Http(err.to_string())
    }
}

/// How requests are authenticated.
pub enum WsmanAuth {
    /// HTTP Basic with username and password
    Basic {
        /// Account name
        username: String,
        /// Password
        password: String,
    },
    /// `Authorization: Bearer` token
    Bearer(String),
    /// TLS client certificate
    ClientCertificate(Identity),
}

impl fmt::Debug for WsmanAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsmanAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            WsmanAuth::Bearer(_) => f.debug_tuple("Bearer").field(&"[REDACTED]").finish(),
            WsmanAuth::ClientCertificate(_) => f.write_str("ClientCertificate"),
        }
    }
}

/// Request credentials kept after the TLS identity moved into the client.
enum RequestAuth {
    Basic { username: String, password: String },
    Bearer(String),
    Certificate,
}

/// WS-Management client bound to one listener.
pub struct WsmanClient {
    endpoint: Endpoint,
    url: String,
    http: Client,
    auth: RequestAuth,
    operation_timeout: Duration,
}

impl fmt::Debug for WsmanClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsmanClient")
            .field("url", &self.url)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl WsmanClient {
    /// Create a client for `endpoint`.
    ///
    /// `timeout` bounds each Receive long-poll on the server side; the HTTP
    /// timeout allows some slack on top of it.
    pub fn new(
        endpoint: &Endpoint,
        auth: WsmanAuth,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, WsmanError> {
        let mut builder = Client::builder()
            .timeout(timeout + Duration::from_secs(10))
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls);

        let auth = match auth {
            WsmanAuth::Basic { username, password } => RequestAuth::Basic { username, password },
            WsmanAuth::Bearer(token) => RequestAuth::Bearer(token),
            WsmanAuth::ClientCertificate(identity) => {
                builder = builder.identity(identity);
                RequestAuth::Certificate
            }
        };

        let http = builder
            .build()
            .map_err(|e| WsmanError::Client(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: endpoint.url(),
            endpoint: endpoint.clone(),
            http,
            auth,
            operation_timeout: timeout,
        })
    }

    /// The listener this client talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Post an envelope and return the response body.
    async fn send(&self, body: String) -> Result<String, WsmanError> {
        let request = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(body);

        let request = match &self.auth {
            RequestAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            RequestAuth::Bearer(token) => request.bearer_auth(token),
            RequestAuth::Certificate => request.header(AUTHORIZATION, CERT_AUTH_PROFILE),
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let mut message = fault_message(&text);
            if message.is_empty() {
                message = status.canonical_reason().unwrap_or("no response body").to_string();
            }
            return Err(WsmanError::Fault {
                status: status.as_u16(),
                code: fault_code(&text),
                message,
            });
        }

        Ok(text)
    }

    fn header(&self, action: &str, shell_id: Option<&str>, extra: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"
    <w:SelectorSet>
      <w:Selector Name="ShellId">{}</w:Selector>
    </w:SelectorSet>"#,
                    id
                )
            })
            .unwrap_or_default();

        format!(
            r#"<s:Header>
    <a:To>{url}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{timeout}S</w:OperationTimeout>{selector}{extra}
  </s:Header>"#,
            url = self.url,
            message_id = Uuid::new_v4(),
            timeout = self.operation_timeout.as_secs().max(1),
        )
    }

    fn envelope(&self, header: String, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  {header}
  {body}
</s:Envelope>"#
        )
    }

    /// Send a WS-Management Identify request.
    pub async fn identify(&self) -> Result<(), WsmanError> {
        debug!(url = %self.url, "Identifying WinRM listener");

        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:wsmid="{IDENTITY_NS}">
  <s:Header/>
  <s:Body>
    <wsmid:Identify/>
  </s:Body>
</s:Envelope>"#
        );

        let response = self.send(envelope).await?;
        if !response.contains("IdentifyResponse") {
            return Err(WsmanError::Protocol(
                "Identify response missing IdentifyResponse".to_string(),
            ));
        }

        debug!(url = %self.url, "WinRM listener identified");
        Ok(())
    }

    /// Run one command line in a fresh shell and collect its output.
    ///
    /// `stdin`, if given, is sent to the command and closed before output is
    /// read. `timeout` bounds the whole run. The command is terminated and
    /// the shell deleted afterwards whether it succeeded, failed or timed
    /// out.
    pub async fn run(
        &self,
        command_line: &str,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<RawOutput, WsmanError> {
        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));

        let shell_id = self.create_shell().await?;
        let result = self
            .run_in_shell(&shell_id, command_line, stdin, deadline)
            .await;

        if let Err(e) = self.delete_shell(&shell_id).await {
            warn!(shell_id = %shell_id, error = %e, "Failed to delete shell");
        }

        result
    }

    async fn run_in_shell(
        &self,
        shell_id: &str,
        command_line: &str,
        stdin: Option<&[u8]>,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<RawOutput, WsmanError> {
        let command_id = self.command(shell_id, command_line).await?;

        let work = async {
            if let Some(input) = stdin {
                self.send_input(shell_id, &command_id, input).await?;
            }
            self.receive(shell_id, &command_id).await
        };

        let result = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command_id = %command_id, timeout = ?limit, "Command timed out, terminating");
                    Err(WsmanError::Timeout(limit))
                }
            },
            None => work.await,
        };

        if let Err(e) = self.signal_terminate(shell_id, &command_id).await {
            debug!(command_id = %command_id, error = %e, "Failed to signal command termination");
        }

        result
    }

    async fn create_shell(&self) -> Result<String, WsmanError> {
        let options = format!(
            r#"
    <w:OptionSet xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
      <w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>
      <w:Option Name="WINRS_CODEPAGE">{CODEPAGE_UTF8}</w:Option>
    </w:OptionSet>"#
        );
        let header = self.header(ACTION_CREATE, None, &options);
        let body = r#"<s:Body>
    <rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>
  </s:Body>"#;

        let response = self.send(self.envelope(header, body)).await?;

        let shell_id = element_text(&response, "rsp:ShellId")
            .or_else(|| selector_value(&response, "ShellId"))
            .ok_or_else(|| WsmanError::Protocol("No ShellId in Create response".to_string()))?;

        debug!(shell_id = %shell_id, "Created WinRM shell");
        Ok(shell_id.to_string())
    }

    async fn command(&self, shell_id: &str, command_line: &str) -> Result<String, WsmanError> {
        let options = r#"
    <w:OptionSet>
      <w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>
      <w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>
    </w:OptionSet>"#;
        let header = self.header(ACTION_COMMAND, Some(shell_id), options);
        let body = format!(
            r#"<s:Body>
    <rsp:CommandLine>
      <rsp:Command>{}</rsp:Command>
    </rsp:CommandLine>
  </s:Body>"#,
            xml_escape(command_line)
        );

        let response = self.send(self.envelope(header, &body)).await?;

        element_text(&response, "rsp:CommandId")
            .map(str::to_string)
            .ok_or_else(|| WsmanError::Protocol("No CommandId in Command response".to_string()))
    }

    /// Write `input` to the command's stdin and close it.
    async fn send_input(&self, shell_id: &str, command_id: &str, input: &[u8]) -> Result<(), WsmanError> {
        let mut chunks = input.chunks(STDIN_CHUNK_SIZE).peekable();
        if chunks.peek().is_none() {
            return self.send_stdin_chunk(shell_id, command_id, &[], true).await;
        }

        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            self.send_stdin_chunk(shell_id, command_id, chunk, last).await?;
        }

        trace!(command_id = %command_id, bytes = input.len(), "Sent stdin");
        Ok(())
    }

    async fn send_stdin_chunk(
        &self,
        shell_id: &str,
        command_id: &str,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), WsmanError> {
        let header = self.header(ACTION_SEND, Some(shell_id), "");
        let end = if last { r#" End="true""# } else { "" };
        let body = format!(
            r#"<s:Body>
    <rsp:Send>
      <rsp:Stream Name="stdin" CommandId="{}"{}>{}</rsp:Stream>
    </rsp:Send>
  </s:Body>"#,
            command_id,
            end,
            BASE64_STANDARD.encode(chunk)
        );

        self.send(self.envelope(header, &body)).await?;
        Ok(())
    }

    async fn receive(&self, shell_id: &str, command_id: &str) -> Result<RawOutput, WsmanError> {
        let mut output = RawOutput::default();

        loop {
            let header = self.header(ACTION_RECEIVE, Some(shell_id), "");
            let body = format!(
                r#"<s:Body>
    <rsp:Receive>
      <rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>
  </s:Body>"#,
                command_id
            );

            let response = match self.send(self.envelope(header, &body)).await {
                Ok(response) => response,
                Err(e) if e.is_operation_timeout() => {
                    trace!(command_id = %command_id, "Receive timed out, polling again");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let chunk = parse_receive(&response)?;
            output.stdout.extend_from_slice(&chunk.stdout);
            output.stderr.extend_from_slice(&chunk.stderr);

            if chunk.done {
                output.exit_code = chunk.exit_code.ok_or_else(|| {
                    WsmanError::Protocol("Command finished without an exit code".to_string())
                })?;
                return Ok(output);
            }
        }
    }

    async fn signal_terminate(&self, shell_id: &str, command_id: &str) -> Result<(), WsmanError> {
        let header = self.header(ACTION_SIGNAL, Some(shell_id), "");
        let body = format!(
            r#"<s:Body>
    <rsp:Signal CommandId="{}">
      <rsp:Code>{SIGNAL_TERMINATE}</rsp:Code>
    </rsp:Signal>
  </s:Body>"#,
            command_id
        );

        self.send(self.envelope(header, &body)).await?;
        Ok(())
    }

    async fn delete_shell(&self, shell_id: &str) -> Result<(), WsmanError> {
        let header = self.header(ACTION_DELETE, Some(shell_id), "");
        self.send(self.envelope(header, "<s:Body/>")).await?;

        debug!(shell_id = %shell_id, "Deleted WinRM shell");
        Ok(())
    }
}

// ============================================================================
// Response parsing
// ============================================================================

#[derive(Debug, Default)]
struct ReceiveChunk {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    done: bool,
}

fn parse_receive(response: &str) -> Result<ReceiveChunk, WsmanError> {
    let mut chunk = ReceiveChunk {
        done: response.contains(COMMAND_STATE_DONE),
        ..Default::default()
    };

    let mut pos = 0;
    while let Some(start) = response[pos..].find("<rsp:Stream ") {
        let tag_start = pos + start;
        let tag_end = match response[tag_start..].find('>') {
            Some(end) => tag_start + end,
            None => break,
        };
        let tag = &response[tag_start..tag_end];
        pos = tag_end + 1;

        // <rsp:Stream Name="stdout" CommandId="..." End="true"/>
        if tag.ends_with('/') {
            continue;
        }

        let content_end = match response[pos..].find("</rsp:Stream>") {
            Some(end) => pos + end,
            None => return Err(WsmanError::Protocol("Unterminated output stream".to_string())),
        };
        let content = response[pos..content_end].trim();
        pos = content_end;

        if content.is_empty() {
            continue;
        }

        let bytes = BASE64_STANDARD
            .decode(content)
            .map_err(|e| WsmanError::Protocol(format!("Invalid stream content: {}", e)))?;

        match attribute(tag, "Name") {
            Some("stdout") => chunk.stdout.extend_from_slice(&bytes),
            Some("stderr") => chunk.stderr.extend_from_slice(&bytes),
            _ => {}
        }
    }

    if let Some(code) = element_text(response, "rsp:ExitCode") {
        chunk.exit_code = Some(code.trim().parse().map_err(|_| {
            WsmanError::Protocol(format!("Invalid exit code '{}'", code))
        })?);
    }

    Ok(chunk)
}

/// Text of the first `<name ...>text</name>` element.
fn element_text<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}", name);
    let close = format!("</{}>", name);

    let mut pos = 0;
    while let Some(start) = response[pos..].find(&open) {
        let after_name = pos + start + open.len();
        pos = after_name;
        // skip longer names sharing the prefix
        match response[after_name..].chars().next() {
            Some('>') | Some(' ') => {}
            _ => continue,
        }
        let content_start = after_name + response[after_name..].find('>')? + 1;
        let content_end = content_start + response[content_start..].find(&close)?;
        return Some(&response[content_start..content_end]);
    }
    None
}

/// Value of `<w:Selector Name="name">value</w:Selector>`.
fn selector_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("Name=\"{}\">", name);
    let start = response.find(&marker)? + marker.len();
    let end = start + response[start..].find("</")?;
    Some(&response[start..end])
}

/// Value of `name="..."` inside a start tag.
fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!(" {}=\"", name);
    let start = tag.find(&marker)? + marker.len();
    let end = start + tag[start..].find('"')?;
    Some(&tag[start..end])
}

fn fault_code(body: &str) -> Option<String> {
    let start = body.find("WSManFault")?;
    let end = start + body[start..].find('>')?;
    attribute(&body[start..end], "Code").map(str::to_string)
}

fn fault_message(body: &str) -> String {
    element_text(body, "f:Message")
        .or_else(|| element_text(body, "s:Text"))
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| body.trim().to_string())
}

/// Escape special characters for XML
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
