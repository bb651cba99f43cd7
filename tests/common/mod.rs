//! Shared test utilities for the integration test suite.
//!
//! This module provides:
//! - In-memory [`CredentialResolver`] and [`SessionBroker`] implementations
//!   that record every call
//! - wiremock helpers for the vault REST API and a WinRM listener
//! - Configuration builders
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use winrm_actionhandler::action::ActionContext;
use winrm_actionhandler::codec::EncodedScript;
use winrm_actionhandler::config::{Config, JumpHostConfig, TenantVaultConfig};
use winrm_actionhandler::session::{
    Endpoint, RawOutput, RemoteSession, SessionBroker, SessionError, SessionResult,
};
use winrm_actionhandler::vault::{Credential, CredentialResolver, VaultEndpoint, VaultError, VaultResult};

/// Tenant token used by every test vault
pub const VAULT_TOKEN: &str = "test-tenant-token";

/// Client certificate and key accepted by `reqwest::Identity::from_pem`
pub fn jump_certificate_pem() -> String {
    std::fs::read_to_string(fixtures_path().join("jump-client.pem"))
        .expect("Failed to read jump-client.pem fixture")
}

pub fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Tagged output for the given stdout lines, as a wrapper script writes it.
pub fn tagged_stdout(lines: &[&str]) -> Vec<u8> {
    lines
        .iter()
        .map(|line| format!("<psout><![CDATA[{}]]></psout>\r\n", line.replace("]]>", "]]]]><![CDATA[>")))
        .collect::<String>()
        .into_bytes()
}

// ============================================================================
// Configuration
// ============================================================================

/// Config with one tenant ("default") pointing at `vault_url`.
pub fn config_with_vault(vault_url: &str) -> Config {
    let mut config = Config::default();
    config.vault.insert(
        "default".to_string(),
        TenantVaultConfig {
            url: Some(vault_url.to_string()),
            token: Some(VAULT_TOKEN.to_string()),
            ..Default::default()
        },
    );
    config
}

/// Add a jump host reachable over plain HTTP at `address`.
pub fn add_jump_host(config: &mut Config, name: &str, address: &std::net::SocketAddr, resource: &str) {
    config.jump_hosts.insert(
        name.to_string(),
        JumpHostConfig {
            vault_resource: Some(resource.to_string()),
            vault_account: Some("winrm-cert".to_string()),
            hostname: Some(address.ip().to_string()),
            port: Some(address.port()),
            use_ssl: Some(false),
        },
    );
}

// ============================================================================
// Mock credential resolver
// ============================================================================

/// What the mock vault answers for a resource/account pair.
#[derive(Debug, Clone)]
pub enum VaultAnswer {
    Found(Credential),
    NotFound,
    Unreachable,
}

/// In-memory vault that records lookups.
#[derive(Debug, Default)]
pub struct MockResolver {
    answers: Mutex<HashMap<(String, String), VaultAnswer>>,
    lookups: Mutex<Vec<(String, String)>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, resource: &str, account: &str, answer: VaultAnswer) -> Self {
        self.answers
            .lock()
            .unwrap()
            .insert((resource.to_string(), account.to_string()), answer);
        self
    }

    pub fn lookups(&self) -> Vec<(String, String)> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialResolver for MockResolver {
    async fn resolve(
        &self,
        _endpoint: &VaultEndpoint,
        resource: &str,
        account: &str,
    ) -> VaultResult<Credential> {
        self.lookups
            .lock()
            .unwrap()
            .push((resource.to_string(), account.to_string()));

        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(&(resource.to_string(), account.to_string()))
            .cloned()
            .unwrap_or(VaultAnswer::NotFound);

        match answer {
            VaultAnswer::Found(credential) => Ok(credential),
            VaultAnswer::NotFound => Err(VaultError::not_found(resource, account, "Resource not found")),
            VaultAnswer::Unreachable => Err(VaultError::Unreachable("connection refused".to_string())),
        }
    }
}

// ============================================================================
// Mock session broker
// ============================================================================

/// Behaviour of the mock broker.
#[derive(Debug, Clone)]
pub enum BrokerBehavior {
    /// Sessions open and return this output
    Succeed(RawOutput),
    /// Opening fails with this message
    RefuseSession(String),
    /// Sessions open but execution fails
    FailExecution(String),
}

/// Broker that records which open calls were made.
#[derive(Debug)]
pub struct MockBroker {
    behavior: BrokerBehavior,
    direct_opens: AtomicUsize,
    proxied_opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    scripts: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl MockBroker {
    pub fn new(behavior: BrokerBehavior) -> Self {
        Self {
            behavior,
            direct_opens: AtomicUsize::new(0),
            proxied_opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            scripts: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every execution take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Highest number of executions observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn succeeding(stdout_lines: &[&str], exit_code: i32) -> Self {
        Self::new(BrokerBehavior::Succeed(RawOutput {
            stdout: tagged_stdout(stdout_lines),
            stderr: Vec::new(),
            exit_code,
        }))
    }

    pub fn direct_opens(&self) -> usize {
        self.direct_opens.load(Ordering::SeqCst)
    }

    pub fn proxied_opens(&self) -> usize {
        self.proxied_opens.load(Ordering::SeqCst)
    }

    pub fn total_opens(&self) -> usize {
        self.direct_opens() + self.proxied_opens()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    fn open(&self, host: &str) -> SessionResult<Box<dyn RemoteSession>> {
        match &self.behavior {
            BrokerBehavior::RefuseSession(message) => {
                Err(SessionError::establishment(host, message.clone()))
            }
            behavior => Ok(Box::new(MockSession {
                host: host.to_string(),
                behavior: behavior.clone(),
                closes: Arc::clone(&self.closes),
                scripts: Arc::clone(&self.scripts),
                delay: self.delay,
                running: Arc::clone(&self.running),
                max_running: Arc::clone(&self.max_running),
            })),
        }
    }
}

#[async_trait]
impl SessionBroker for MockBroker {
    async fn open_direct(
        &self,
        target: &Endpoint,
        _credential: &Credential,
    ) -> SessionResult<Box<dyn RemoteSession>> {
        self.direct_opens.fetch_add(1, Ordering::SeqCst);
        self.open(&target.host)
    }

    async fn open_via_jump_host(
        &self,
        jump: &Endpoint,
        _jump_certificate: &Credential,
        target_host: &str,
        _target_credential: &Credential,
    ) -> SessionResult<Box<dyn RemoteSession>> {
        self.proxied_opens.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            BrokerBehavior::RefuseSession(message) => {
                Err(SessionError::establishment(&jump.host, message.clone()))
            }
            _ => self.open(target_host),
        }
    }
}

#[derive(Debug)]
struct MockSession {
    host: String,
    behavior: BrokerBehavior,
    closes: Arc<AtomicUsize>,
    scripts: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteSession for MockSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(
        &self,
        script: &EncodedScript,
        timeout: Option<Duration>,
    ) -> SessionResult<RawOutput> {
        self.scripts.lock().unwrap().push(script.wrapper().to_string());

        if let Some(delay) = self.delay {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let timed_out = timeout.filter(|limit| *limit < delay);
            tokio::time::sleep(timed_out.unwrap_or(delay)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if let Some(limit) = timed_out {
                return Err(SessionError::execution(
                    &self.host,
                    format!("Command timed out after {:?}", limit),
                ));
            }
        }

        match &self.behavior {
            BrokerBehavior::Succeed(output) => Ok(output.clone()),
            BrokerBehavior::FailExecution(message) => {
                Err(SessionError::execution(&self.host, message.clone()))
            }
            BrokerBehavior::RefuseSession(_) => unreachable!("session was never opened"),
        }
    }

    async fn close(&self) -> SessionResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Context wired to mocks.
pub fn mock_context(
    config: Config,
    resolver: Arc<MockResolver>,
    broker: Arc<MockBroker>,
) -> ActionContext {
    ActionContext::new(Arc::new(config), resolver, broker)
}

// ============================================================================
// wiremock: vault
// ============================================================================

/// Mount a vault account whose password endpoint returns `details`.
pub async fn mount_vault_account(
    server: &MockServer,
    resource: &str,
    account: &str,
    ids: (u64, u64),
    details: serde_json::Value,
) {
    let (rid, aid) = ids;

    Mock::given(method("GET"))
        .and(path("/restapi/json/v1/resources/getResourceIdAccountId"))
        .and(query_param("RESOURCENAME", resource))
        .and(query_param("ACCOUNTNAME", account))
        .and(header("AUTHTOKEN", VAULT_TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "operation": {
                "name": "GET_RESOURCEACCOUNTID",
                "result": {"status": "Success", "message": "Resource ID and account ID fetched successfully"},
                "Details": {"RESOURCEID": rid.to_string(), "ACCOUNTID": aid.to_string()}
            }
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/restapi/json/v1/resources/{}/accounts/{}/password",
            rid, aid
        )))
        .and(header("AUTHTOKEN", VAULT_TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "operation": {
                "name": "GET PASSWORD",
                "result": {"status": "Success", "message": "Password fetched successfully"},
                "Details": details
            }
        })))
        .mount(server)
        .await;
}

/// Mount a lookup that the vault answers with `status: Failed`.
pub async fn mount_vault_missing(server: &MockServer, resource: &str, account: &str) {
    Mock::given(method("GET"))
        .and(path("/restapi/json/v1/resources/getResourceIdAccountId"))
        .and(query_param("RESOURCENAME", resource))
        .and(query_param("ACCOUNTNAME", account))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "operation": {
                "name": "GET_RESOURCEACCOUNTID",
                "result": {"status": "Failed", "message": "Resource not found"}
            }
        })))
        .mount(server)
        .await;
}

// ============================================================================
// wiremock: WinRM listener
// ============================================================================

const SHELL_ID: &str = "11111111-2222-3333-4444-555555555555";
const COMMAND_ID: &str = "66666666-7777-8888-9999-000000000000";

fn soap(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "application/soap+xml;charset=UTF-8")
        .set_body_string(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Header/><s:Body>{}</s:Body></s:Envelope>"#,
            body
        ))
}

/// Mount a WinRM listener that runs every command with the given output.
pub async fn mount_winrm(server: &MockServer, stdout: &[u8], exit_code: i32) {
    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("wsmid:Identify"))
        .respond_with(soap(
            r#"<wsmid:IdentifyResponse xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd"><wsmid:ProtocolVersion>http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd</wsmid:ProtocolVersion><wsmid:ProductVendor>Microsoft Corporation</wsmid:ProductVendor></wsmid:IdentifyResponse>"#,
        ))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("transfer/Create</a:Action>"))
        .respond_with(soap(&format!(
            "<rsp:Shell><rsp:ShellId>{}</rsp:ShellId></rsp:Shell>",
            SHELL_ID
        )))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("shell/Command</a:Action>"))
        .respond_with(soap(&format!(
            "<rsp:CommandResponse><rsp:CommandId>{}</rsp:CommandId></rsp:CommandResponse>",
            COMMAND_ID
        )))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("shell/Receive</a:Action>"))
        .respond_with(soap(&format!(
            r#"<rsp:ReceiveResponse><rsp:Stream Name="stdout" CommandId="{id}">{out}</rsp:Stream><rsp:Stream Name="stdout" CommandId="{id}" End="true"/><rsp:Stream Name="stderr" CommandId="{id}" End="true"/><rsp:CommandState CommandId="{id}" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>{code}</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse>"#,
            id = COMMAND_ID,
            out = BASE64_STANDARD.encode(stdout),
            code = exit_code
        )))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("shell/Send</a:Action>"))
        .respond_with(soap("<rsp:SendResponse/>"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("shell/Signal</a:Action>"))
        .respond_with(soap("<rsp:SignalResponse/>"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("transfer/Delete</a:Action>"))
        .respond_with(soap(""))
        .mount(server)
        .await;
}

/// Override the Receive answer of a listener mounted with [`mount_winrm`].
///
/// `exit_code: None` leaves the exit code out of the finished command state.
pub async fn mount_winrm_receive(
    server: &MockServer,
    stderr: &[u8],
    exit_code: Option<i32>,
    delay: Option<Duration>,
) {
    let mut response = soap(&format!(
        r#"<rsp:ReceiveResponse><rsp:Stream Name="stdout" CommandId="{id}" End="true"/><rsp:Stream Name="stderr" CommandId="{id}">{err}</rsp:Stream><rsp:Stream Name="stderr" CommandId="{id}" End="true"/><rsp:CommandState CommandId="{id}" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">{code}</rsp:CommandState></rsp:ReceiveResponse>"#,
        id = COMMAND_ID,
        err = BASE64_STANDARD.encode(stderr),
        code = exit_code
            .map(|code| format!("<rsp:ExitCode>{}</rsp:ExitCode>", code))
            .unwrap_or_default()
    ));
    if let Some(delay) = delay {
        response = response.set_delay(delay);
    }

    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("shell/Receive</a:Action>"))
        .respond_with(response)
        .with_priority(1)
        .mount(server)
        .await;
}

/// Bodies of the WS-Man requests received for `action`, e.g. `"shell/Command"`.
pub async fn received_actions(server: &MockServer, action: &str) -> Vec<String> {
    let marker = format!("{}</a:Action>", action);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .filter(|body| body.contains(&marker))
        .collect()
}

/// Text of the `<rsp:Command>` element in a Command request body.
pub fn command_line_of(body: &str) -> &str {
    let start = body.find("<rsp:Command>").map(|i| i + "<rsp:Command>".len()).unwrap_or(0);
    let end = body[start..].find("</rsp:Command>").map(|i| start + i).unwrap_or(body.len());
    &body[start..end]
}

/// Mount a WinRM listener that rejects every request with 401.
pub async fn mount_winrm_unauthorized(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/wsman"))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
}

/// Number of files left in `dir`.
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
