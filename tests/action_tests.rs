//! Integration tests for the command action state machine.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

use winrm_actionhandler::action::{
    ActionContext, ActionState, CommandAction, ErrorKind, ExecutionRequest,
};
use winrm_actionhandler::codec::InterpreterKind;
use winrm_actionhandler::config::{Config, JumpHostConfig};
use winrm_actionhandler::session::{BrokerOptions, RawOutput, Transport, WsmanBroker};
use winrm_actionhandler::vault::{Credential, VaultClient};

fn request() -> ExecutionRequest {
    ExecutionRequest::new(1, "web01", "echo hi", InterpreterKind::Cmd)
        .with_credentials("web01", "svc_autopilot")
}

fn config() -> Config {
    let mut config = config_with_vault("https://vault.invalid:7272");
    config.jump_hosts.insert(
        "jump1".to_string(),
        JumpHostConfig {
            vault_resource: Some("jump1.example.com".to_string()),
            vault_account: Some("winrm-cert".to_string()),
            ..Default::default()
        },
    );
    config
}

fn resolver_with_target() -> MockResolver {
    MockResolver::new().with(
        "web01",
        "svc_autopilot",
        VaultAnswer::Found(Credential::password("svc_autopilot", "pw")),
    )
}

// ============================================================================
// Success
// ============================================================================

#[tokio::test]
async fn test_direct_success() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver.clone(), broker.clone());

    let mut action = CommandAction::new(request(), context);
    assert_eq!(action.state(), ActionState::Created);

    let result = action.run().await;

    assert!(result.success, "{:?}", result.status_message);
    assert_eq!(result.stdout, "hi");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.status_message, None);
    assert_eq!(action.state(), ActionState::Succeeded);
    assert_eq!(broker.direct_opens(), 1);
    assert_eq!(broker.proxied_opens(), 0);
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_nonzero_exit_is_still_success() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["failed to copy"], 5));
    let context = mock_context(config(), resolver, broker);

    let result = CommandAction::new(request(), context).run().await;

    assert!(result.success);
    assert_eq!(result.exit_code, Some(5));
}

#[tokio::test]
async fn test_script_is_encoded_for_interpreter() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&[], 0));
    let context = mock_context(config(), resolver, broker.clone());

    let request = ExecutionRequest::new(1, "web01", "Get-Date", InterpreterKind::PowerShell)
        .with_credentials("web01", "svc_autopilot");
    CommandAction::new(request, context).run().await;

    let scripts = broker.scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("powershell -"));
}

#[tokio::test]
async fn test_proxied_success() {
    let resolver = Arc::new(resolver_with_target().with(
        "jump1.example.com",
        "winrm-cert",
        VaultAnswer::Found(Credential::certificate("pem")),
    ));
    let broker = Arc::new(MockBroker::succeeding(&["via jump"], 0));
    let context = mock_context(config(), resolver.clone(), broker.clone());

    let result = CommandAction::new(request().with_jump_host("jump1"), context)
        .run()
        .await;

    assert!(result.success);
    assert_eq!(result.stdout, "via jump");
    assert_eq!(broker.proxied_opens(), 1);
    assert_eq!(broker.direct_opens(), 0);
    assert_eq!(
        resolver.lookups(),
        vec![
            ("web01".to_string(), "svc_autopilot".to_string()),
            ("jump1.example.com".to_string(), "winrm-cert".to_string()),
        ]
    );
}

// ============================================================================
// Credential failures
// ============================================================================

#[tokio::test]
async fn test_credential_not_found_skips_session() {
    let resolver = Arc::new(MockResolver::new());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver, broker.clone());

    let mut action = CommandAction::new(request(), context);
    let result = action.run().await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::CredentialNotFound));
    assert!(result.status_message.unwrap().contains("web01"));
    assert_eq!(action.state(), ActionState::Failed);
    assert_eq!(broker.total_opens(), 0);
}

#[tokio::test]
async fn test_vault_unreachable() {
    let resolver = Arc::new(MockResolver::new().with("web01", "svc_autopilot", VaultAnswer::Unreachable));
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver, broker.clone());

    let result = CommandAction::new(request(), context).run().await;

    assert_eq!(result.error_kind, Some(ErrorKind::VaultUnreachable));
    assert_eq!(broker.total_opens(), 0);
}

#[tokio::test]
async fn test_jump_certificate_missing_names_jump_host() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver, broker.clone());

    let result = CommandAction::new(request().with_jump_host("jump1"), context)
        .run()
        .await;

    assert_eq!(result.error_kind, Some(ErrorKind::CredentialNotFound));
    assert!(result.status_message.unwrap().starts_with("Jump host 'jump1'"));
    assert_eq!(broker.total_opens(), 0);
}

// ============================================================================
// Configuration failures
// ============================================================================

#[tokio::test]
async fn test_jump_host_config_missing_before_any_lookup() {
    let mut config = config();
    config.jump_hosts.insert(
        "jump2".to_string(),
        JumpHostConfig {
            vault_resource: Some("jump2".to_string()),
            vault_account: None,
            ..Default::default()
        },
    );

    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config, resolver.clone(), broker.clone());

    let result = CommandAction::new(request().with_jump_host("jump2"), context)
        .run()
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ConfigurationMissing));
    assert!(result
        .status_message
        .unwrap()
        .contains("Jumpserver config for vault is missing"));
    assert_eq!(resolver.lookup_count(), 0);
    assert_eq!(broker.total_opens(), 0);
}

#[tokio::test]
async fn test_unknown_jump_host() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver.clone(), broker);

    let result = CommandAction::new(request().with_jump_host("nowhere"), context)
        .run()
        .await;

    assert_eq!(result.error_kind, Some(ErrorKind::ConfigurationMissing));
    assert_eq!(resolver.lookup_count(), 0);
}

#[tokio::test]
async fn test_unknown_customer() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver.clone(), broker);

    let result = CommandAction::new(request().with_customer("acme"), context)
        .run()
        .await;

    assert_eq!(result.error_kind, Some(ErrorKind::ConfigurationMissing));
    assert!(result.status_message.unwrap().contains("acme"));
    assert_eq!(resolver.lookup_count(), 0);
}

#[tokio::test]
async fn test_empty_account_rejected() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["hi"], 0));
    let context = mock_context(config(), resolver.clone(), broker);

    let request = ExecutionRequest::new(1, "web01", "echo hi", InterpreterKind::Cmd)
        .with_credentials("web01", "");
    let result = CommandAction::new(request, context).run().await;

    assert_eq!(result.error_kind, Some(ErrorKind::ConfigurationMissing));
    assert_eq!(
        result.status_message.as_deref(),
        Some("Request parameter 'ServiceAccount' is empty")
    );
    assert_eq!(resolver.lookup_count(), 0);
}

// ============================================================================
// Session and execution failures
// ============================================================================

#[tokio::test]
async fn test_proxied_negotiation_failure() {
    let resolver = Arc::new(resolver_with_target().with(
        "jump1.example.com",
        "winrm-cert",
        VaultAnswer::Found(Credential::certificate("pem")),
    ));
    let broker = Arc::new(MockBroker::new(BrokerBehavior::RefuseSession(
        "certificate rejected by jump host".to_string(),
    )));
    let context = mock_context(config(), resolver, broker);

    let result = CommandAction::new(request().with_jump_host("jump1"), context)
        .run()
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::SessionEstablishment));
    let message = result.status_message.unwrap();
    assert!(message.contains("certificate rejected by jump host"));
    assert!(message.contains("jump1"));
}

#[tokio::test]
async fn test_execution_failure_closes_session() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::new(BrokerBehavior::FailExecution(
        "connection reset".to_string(),
    )));
    let context = mock_context(config(), resolver, broker.clone());

    let mut action = CommandAction::new(request(), context);
    let result = action.run().await;

    assert_eq!(result.error_kind, Some(ErrorKind::RemoteExecution));
    assert!(result.status_message.unwrap().contains("connection reset"));
    assert_eq!(action.state(), ActionState::Failed);
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_malformed_output_is_remote_execution_error() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::new(BrokerBehavior::Succeed(RawOutput {
        stdout: b"The term 'mode.com' is not recognized".to_vec(),
        stderr: Vec::new(),
        exit_code: 1,
    })));
    let context = mock_context(config(), resolver, broker);

    let result = CommandAction::new(request(), context).run().await;

    assert_eq!(result.error_kind, Some(ErrorKind::RemoteExecution));
    assert!(result.status_message.unwrap().contains("Malformed tagged output"));
}

#[tokio::test]
async fn test_execution_timeout() {
    let resolver = Arc::new(resolver_with_target());
    let broker = Arc::new(MockBroker::succeeding(&["late"], 0).with_delay(Duration::from_secs(5)));
    let context = mock_context(config(), resolver, broker.clone());

    let request = request().with_timeout(Duration::from_millis(50));
    let mut action = CommandAction::new(request, context);
    let result = action.run().await;

    assert_eq!(result.error_kind, Some(ErrorKind::RemoteExecution));
    let message = result.status_message.unwrap();
    assert!(message.contains("timed out after 50ms"), "{}", message);
    assert_eq!(action.state(), ActionState::Failed);
    assert_eq!(broker.closes(), 1);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_end_to_end_direct() {
    let vault = MockServer::start().await;
    mount_vault_account(
        &vault,
        "web01",
        "svc_autopilot",
        (301, 1201),
        serde_json::json!({"PASSWORD": "s3cret"}),
    )
    .await;

    let winrm = MockServer::start().await;
    mount_winrm(&winrm, &tagged_stdout(&["hi"]), 0).await;

    let context = ActionContext::new(
        Arc::new(config_with_vault(&vault.uri())),
        Arc::new(VaultClient::new().unwrap()),
        Arc::new(WsmanBroker::new(BrokerOptions {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })),
    );

    let address = winrm.address();
    let request = ExecutionRequest::new(42, address.ip().to_string(), "echo hi", InterpreterKind::Cmd)
        .with_credentials("web01", "svc_autopilot")
        .with_endpoint(address.port(), Transport::Http);

    let result = CommandAction::new(request, context).run().await;

    assert!(result.success, "{:?}", result.status_message);
    assert_eq!(result.num, 42);
    assert_eq!(result.stdout, "hi");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.raw_stdout.contains("<psout>"));
}
