//! HTTP-level tests for the credential-rotating client against a local mock server.

use intake_orchestrator::client::{
    CallOptions, Credential, CredentialRotatingClient, ExtractionService, RequestContent,
};
use intake_orchestrator::config::ServiceConfig;
use intake_orchestrator::resilience::{CircuitState, DependencyGuard, GuardRegistry};
use intake_orchestrator::{ClassificationHints, Error, OrchestratorConfig};
use std::sync::Arc;

fn service_config(base_url: &str) -> ServiceConfig {
    ServiceConfig {
        base_url: base_url.to_string(),
        requests_per_minute: 60_000,
        rotation_delay_ms: 0,
        timeout_ms: 5_000,
        failure_threshold: 2,
        ..ServiceConfig::default()
    }
}

fn client(name: &str, cfg: ServiceConfig, keys: &[(&str, &str)]) -> CredentialRotatingClient {
    let guard = Arc::new(DependencyGuard::from_service(name, &cfg));
    let credentials = keys
        .iter()
        .map(|(label, secret)| Credential::new(*label, *secret))
        .collect();
    CredentialRotatingClient::new(name, cfg, credentials, guard).unwrap()
}

fn invoice() -> RequestContent {
    RequestContent::Url("https://files.example.com/invoice-7.pdf".into())
}

#[tokio::test]
async fn test_quota_on_first_key_rotates_to_backup() {
    let mut server = mockito::Server::new_async().await;
    let quota = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer key-primary")
        .with_status(429)
        .with_body(r#"{"error":"quota exceeded"}"#)
        .expect(1)
        .create_async()
        .await;
    let ok = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer key-backup")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"fields":{"issuer":"ACME","total":1200},"confidence":0.91,"cost":{"ocr":0.002,"llm":0.01}}"#)
        .expect(1)
        .create_async()
        .await;

    let c = client(
        "structurer",
        service_config(&server.url()),
        &[("AI_KEY", "key-primary"), ("AI_KEY_BACKUP", "key-backup")],
    );
    let options =
        CallOptions::with_hints(ClassificationHints::new(Some("company"), Some("invoice")));
    let resp = c.call(&invoice(), "Extract", &options).await.unwrap();

    assert_eq!(resp.fields["issuer"], serde_json::json!("ACME"));
    assert_eq!(resp.confidence, 0.91);
    assert!((resp.cost.total - 0.012).abs() < 1e-9);
    quota.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn test_all_keys_out_of_quota() {
    let mut server = mockito::Server::new_async().await;
    let quota = server
        .mock("POST", "/v1/extract")
        .with_status(429)
        .with_body("rate limit")
        .expect(2)
        .create_async()
        .await;

    let c = client(
        "ocr",
        service_config(&server.url()),
        &[("OCR_KEY", "a"), ("OCR_KEY_BACKUP", "b")],
    );
    let err = c
        .call(&invoice(), "Transcribe", &CallOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::AllCredentialsExhausted { service, attempts } => {
            assert_eq!(service, "ocr");
            assert_eq!(attempts.len(), 2);
            assert!(attempts[0].starts_with("OCR_KEY: "));
            assert!(attempts[1].starts_with("OCR_KEY_BACKUP: "));
        }
        other => panic!("unexpected error: {other}"),
    }
    quota.assert_async().await;
}

#[tokio::test]
async fn test_transient_failure_does_not_rotate() {
    let mut server = mockito::Server::new_async().await;
    let unavailable = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer a")
        .with_status(503)
        .with_body("upstream unavailable")
        .expect(1)
        .create_async()
        .await;
    let backup = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer b")
        .with_status(200)
        .with_body(r#"{"fields":{"x":1}}"#)
        .expect(0)
        .create_async()
        .await;

    let c = client(
        "ocr",
        service_config(&server.url()),
        &[("OCR_KEY", "a"), ("OCR_KEY_BACKUP", "b")],
    );
    let err = c
        .call(&invoice(), "Transcribe", &CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::TransientDependency { status: Some(503), .. }
    ));
    assert!(err.is_retryable());
    unavailable.assert_async().await;
    backup.assert_async().await;
}

#[tokio::test]
async fn test_single_rejected_key_surfaces_rejection() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/v1/extract")
        .with_status(401)
        .with_body("invalid api key")
        .create_async()
        .await;

    let c = client("ocr", service_config(&server.url()), &[("OCR_KEY", "bad")]);
    let err = c
        .call(&invoice(), "Transcribe", &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HardFailure { status: 401, .. }));
    assert!(err.is_credential_scoped());
}

#[tokio::test]
async fn test_rejected_request_does_not_rotate() {
    let mut server = mockito::Server::new_async().await;
    let rejected = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer a")
        .with_status(422)
        .with_body("unsupported document format")
        .expect(1)
        .create_async()
        .await;
    let backup = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer b")
        .with_status(200)
        .with_body(r#"{"fields":{"x":1}}"#)
        .expect(0)
        .create_async()
        .await;

    let c = client(
        "ocr",
        service_config(&server.url()),
        &[("OCR_KEY", "a"), ("OCR_KEY_BACKUP", "b")],
    );
    let err = c
        .call(&invoice(), "Transcribe", &CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HardFailure { status: 422, .. }));
    assert!(!err.is_credential_scoped());
    rejected.assert_async().await;
    backup.assert_async().await;
}

#[tokio::test]
async fn test_malformed_body_is_reported_with_snippet() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/v1/extract")
        .with_status(200)
        .with_body("<html>gateway page</html>")
        .create_async()
        .await;

    let c = client("structurer", service_config(&server.url()), &[("AI_KEY", "k")]);
    let err = c
        .call(&invoice(), "Extract", &CallOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::MalformedResponse { service, snippet, .. } => {
            assert_eq!(service, "structurer");
            assert!(snippet.starts_with("<html>"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_fenced_json_inside_completion_envelope() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "completion": "Here you go:\n```json\n{\"issuer\":\"ACME\",\"iban\":\"DE00\"}\n```",
        "confidence": 0.8
    });
    let _m = server
        .mock("POST", "/v1/extract")
        .with_status(200)
        .with_body(body.to_string())
        .create_async()
        .await;

    let c = client("structurer", service_config(&server.url()), &[("AI_KEY", "k")]);
    let resp = c
        .call(&invoice(), "Extract", &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.fields["iban"], serde_json::json!("DE00"));
    assert_eq!(resp.confidence, 0.8);
}

#[tokio::test]
async fn test_repeated_transient_failures_open_the_shared_circuit() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("POST", "/v1/extract")
        .with_status(500)
        .with_body("boom")
        .expect(2)
        .create_async()
        .await;

    let mut config = OrchestratorConfig::default();
    config
        .services
        .insert("ocr".into(), service_config(&server.url()));
    let guards = GuardRegistry::from_config(&config);
    let c = CredentialRotatingClient::new(
        "ocr",
        service_config(&server.url()),
        vec![Credential::new("OCR_KEY", "k")],
        guards.guard("ocr"),
    )
    .unwrap();

    for _ in 0..2 {
        let _ = c.call(&invoice(), "Transcribe", &CallOptions::default()).await;
    }
    assert_eq!(guards.guard("ocr").breaker().state(), CircuitState::Open);

    let err = c
        .call(&invoice(), "Transcribe", &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    failing.assert_async().await;
}

#[tokio::test]
async fn test_probe_uses_probe_path() {
    let mut server = mockito::Server::new_async().await;
    let probe = server
        .mock("POST", "/health/probe")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let cfg = ServiceConfig {
        probe_path: "/health/probe".into(),
        ..service_config(&server.url())
    };
    let c = client("ocr", cfg, &[("OCR_KEY", "k")]);
    c.probe().await.unwrap();
    probe.assert_async().await;
}

#[tokio::test]
async fn test_credentials_resolved_from_environment() {
    std::env::set_var("INTAKE_TEST_ROTATION_KEY_A", "env-secret-a");
    let mut server = mockito::Server::new_async().await;
    let m = server
        .mock("POST", "/v1/extract")
        .match_header("authorization", "Bearer env-secret-a")
        .with_status(200)
        .with_body(r#"{"fields":{"ok":true}}"#)
        .expect(1)
        .create_async()
        .await;

    let cfg = ServiceConfig {
        credentials: vec![
            "INTAKE_TEST_ROTATION_KEY_MISSING".into(),
            "INTAKE_TEST_ROTATION_KEY_A".into(),
        ],
        ..service_config(&server.url())
    };
    let guards = GuardRegistry::new();
    let c = CredentialRotatingClient::from_config("env-service", &cfg, &guards).unwrap();
    assert_eq!(c.credential_labels(), vec!["INTAKE_TEST_ROTATION_KEY_A"]);

    c.call(&invoice(), "Extract", &CallOptions::default())
        .await
        .unwrap();
    m.assert_async().await;
}
