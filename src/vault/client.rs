//! HTTP client for the password vault REST API.
//!
//! Lookups follow the Password Manager Pro layout:
//!
//! ```text
//! GET /restapi/json/v1/resources/getResourceIdAccountId?RESOURCENAME=..&ACCOUNTNAME=..
//! GET /restapi/json/v1/resources/{RESOURCEID}/accounts/{ACCOUNTID}/password
//! ```
//!
//! Both requests carry the tenant's token in the `AUTHTOKEN` header and
//! answer with an `operation` envelope whose `result.status` is either
//! `Success` or `Failed`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::credential::Credential;
use super::error::{VaultError, VaultResult};
use super::CredentialResolver;

/// Default timeout for vault requests
pub const DEFAULT_VAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the tenant token
const AUTH_HEADER: &str = "AUTHTOKEN";

/// Where and how to reach one tenant's vault.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultEndpoint {
    /// Base URL, e.g. `https://vault.example.com:7272`
    pub url: String,
    /// Pre-shared per-tenant API token
    pub token: String,
    /// Verify the vault's TLS certificate
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl VaultEndpoint {
    /// Create an endpoint with default TLS verification and timeout.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            verify_tls: true,
            timeout: DEFAULT_VAULT_TIMEOUT,
        }
    }

    /// Set TLS verification.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build an API URL below `/restapi/json/v1/resources`.
    fn resources_url(&self, segments: &[&str]) -> VaultResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| VaultError::Configuration(format!("Invalid vault URL '{}': {}", self.url, e)))?;

        url.path_segments_mut()
            .map_err(|_| {
                VaultError::Configuration(format!("Vault URL '{}' cannot be a base", self.url))
            })?
            .pop_if_empty()
            .extend(["restapi", "json", "v1", "resources"])
            .extend(segments);

        Ok(url)
    }
}

impl fmt::Debug for VaultEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultEndpoint")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .field("verify_tls", &self.verify_tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    operation: Operation<T>,
}

#[derive(Debug, Deserialize)]
struct Operation<T> {
    result: OperationStatus,
    #[serde(rename = "Details")]
    details: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AccountIds {
    #[serde(rename = "RESOURCEID")]
    resource_id: serde_json::Value,
    #[serde(rename = "ACCOUNTID")]
    account_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SecretDetails {
    #[serde(rename = "CERTIFICATE")]
    certificate: Option<String>,
    #[serde(rename = "TOKEN")]
    token: Option<String>,
    #[serde(rename = "PASSWORD")]
    password: Option<String>,
}

/// Ids come back as strings or numbers depending on the vault version.
fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Client
// ============================================================================

/// Vault client shared by all concurrent actions.
///
/// Holds one HTTP client per TLS verification mode; the endpoint and token
/// are supplied per lookup so one client serves every tenant.
#[derive(Debug, Clone)]
pub struct VaultClient {
    verified: Client,
    unverified: Client,
}

impl VaultClient {
    /// Create a new vault client.
    pub fn new() -> VaultResult<Self> {
        let build = |verify: bool| {
            Client::builder()
                .danger_accept_invalid_certs(!verify)
                .build()
                .map_err(|e| {
                    VaultError::Configuration(format!("Failed to build HTTP client: {}", e))
                })
        };

        Ok(Self {
            verified: build(true)?,
            unverified: build(false)?,
        })
    }

    fn client_for(&self, endpoint: &VaultEndpoint) -> &Client {
        if endpoint.verify_tls {
            &self.verified
        } else {
            &self.unverified
        }
    }

    /// Issue a GET and unwrap the operation envelope.
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &VaultEndpoint,
        url: Url,
        resource: &str,
        account: &str,
    ) -> VaultResult<T> {
        let response = self
            .client_for(endpoint)
            .get(url)
            .header(AUTH_HEADER, &endpoint.token)
            .timeout(endpoint.timeout)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(VaultError::not_found(resource, account, "HTTP 404"));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VaultError::Unreachable(format!(
                "Vault rejected the tenant token (HTTP {})",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::Unreachable(format!(
                "Vault returned HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| VaultError::InvalidResponse(e.to_string()))?;
        let operation = envelope.operation;

        if !operation.result.status.eq_ignore_ascii_case("success") {
            return Err(VaultError::not_found(
                resource,
                account,
                operation.result.message,
            ));
        }

        operation
            .details
            .ok_or_else(|| VaultError::InvalidResponse("No Details in vault response".into()))
    }

    /// Look up the vault's internal ids for a resource/account pair.
    async fn account_ids(
        &self,
        endpoint: &VaultEndpoint,
        resource: &str,
        account: &str,
    ) -> VaultResult<(String, String)> {
        let mut url = endpoint.resources_url(&["getResourceIdAccountId"])?;
        url.query_pairs_mut()
            .append_pair("RESOURCENAME", resource)
            .append_pair("ACCOUNTNAME", account);

        let ids: AccountIds = self.get(endpoint, url, resource, account).await?;

        match (id_string(&ids.resource_id), id_string(&ids.account_id)) {
            (Some(rid), Some(aid)) => Ok((rid, aid)),
            _ => Err(VaultError::not_found(
                resource,
                account,
                "Vault returned no resource/account id",
            )),
        }
    }

    /// Resolve a resource/account pair to a credential.
    ///
    /// Always queries the vault; nothing is cached between calls.
    pub async fn fetch(
        &self,
        endpoint: &VaultEndpoint,
        resource: &str,
        account: &str,
    ) -> VaultResult<Credential> {
        debug!(vault = %endpoint.url, resource = %resource, account = %account, "Resolving credential");

        let (rid, aid) = self.account_ids(endpoint, resource, account).await?;
        let url = endpoint.resources_url(&[&rid, "accounts", &aid, "password"])?;
        let details: SecretDetails = self.get(endpoint, url, resource, account).await?;

        let credential = if let Some(pem) = details.certificate.filter(|s| !s.is_empty()) {
            Credential::certificate(pem)
        } else if let Some(token) = details.token.filter(|s| !s.is_empty()) {
            Credential::token(token)
        } else if let Some(password) = details.password {
            Credential::password(account, password)
        } else {
            return Err(VaultError::not_found(
                resource,
                account,
                "No secret stored for account",
            ));
        };

        debug!(
            resource = %resource,
            account = %account,
            kind = %credential.kind(),
            "Credential resolved"
        );

        Ok(credential)
    }
}

#[async_trait]
impl CredentialResolver for VaultClient {
    async fn resolve(
        &self,
        endpoint: &VaultEndpoint,
        resource: &str,
        account: &str,
    ) -> VaultResult<Credential> {
        self.fetch(endpoint, resource, account).await
    }
}
