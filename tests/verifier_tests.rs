//! Integration tests for SmtpVerificationService against scripted servers.

use mailprobe::config::{StartTlsMode, ValidatorConfig, VerifyOptions};
use mailprobe::dns::{DnsMxLookup, MxLookup, MxResolver};
use mailprobe::mocks::{MockMxLookup, MockSmtpServer, ServerScript};
use mailprobe::observability::ProbeMetrics;
use mailprobe::pool::ConnectionPool;
use mailprobe::rotation::RotationService;
use mailprobe::types::{MxRecord, ReasonCode, Verdict};
use mailprobe::{classify, SmtpVerificationService};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> ValidatorConfig {
    ValidatorConfig::builder()
        .connect_timeout(Duration::from_millis(500))
        .read_timeout(Duration::from_millis(300))
        .acquire_timeout(Duration::from_millis(50))
        .helo_domains(["a.probe.example.org", "b.probe.example.net"])
        .from_addresses(["check@probe.example.org", "check@probe.example.net"])
        .build()
        .unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn create_service(config: ValidatorConfig, lookup: MockMxLookup) -> SmtpVerificationService {
    let config = Arc::new(config);
    SmtpVerificationService::new(
        config.clone(),
        Arc::new(MxResolver::new(Arc::new(lookup), &config)),
        Arc::new(ConnectionPool::new(&config)),
        Arc::new(RotationService::from_config(&config)),
        Arc::new(ProbeMetrics::new()),
    )
}

#[rstest]
#[case(550, "User unknown", Verdict::Invalid, ReasonCode::InvalidUser)]
#[case(451, "greylisted, try again later", Verdict::Unknown, ReasonCode::Greylisted)]
#[case(250, "2.1.5 Ok", Verdict::Valid, ReasonCode::Accepted)]
#[case(421, "Service not available", Verdict::Unknown, ReasonCode::ServiceUnavailable)]
#[case(550, "5.7.1 Greylisted, please retry", Verdict::Unknown, ReasonCode::Greylisted)]
#[case(550, "Blocked by Spamhaus", Verdict::Invalid, ReasonCode::ServerReject)]
fn test_reply_classification(
    #[case] code: u16,
    #[case] text: &str,
    #[case] result: Verdict,
    #[case] reason: ReasonCode,
) {
    let raw = format!("{} {}", code, text);
    let first = classify(code, text, &raw);
    assert_eq!(first.result, result);
    assert_eq!(first.reason_code, reason);
    assert_eq!(first, classify(code, text, &raw));
}

#[tokio::test]
async fn test_helo_fallback() {
    init_tracing();
    let server = MockSmtpServer::start(ServerScript::default().without_ehlo()).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);

    let outcome = service.verify_email("jane@corp.test", None).await;
    assert_eq!(outcome.result, Verdict::Valid);
    assert!(server.commands().iter().any(|c| c.starts_with("HELO ")));
}

#[tokio::test]
async fn test_starttls_auto_continues_in_clear_text() {
    let server = MockSmtpServer::start(ServerScript::default().advertise_starttls()).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);

    let outcome = service.verify_email("jane@corp.test", None).await;
    assert_eq!(outcome.result, Verdict::Valid);
    assert!(!outcome.smtp_details.unwrap().tls);
    assert!(server.commands().iter().any(|c| c == "STARTTLS"));
}

#[tokio::test]
async fn test_starttls_required_but_missing() {
    let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);
    let options = VerifyOptions {
        starttls: Some(StartTlsMode::On),
        ..Default::default()
    };

    let outcome = service.verify_email("jane@corp.test", Some(&options)).await;
    assert_eq!(outcome.result, Verdict::Unknown);
    assert!(!server.commands().iter().any(|c| c.starts_with("MAIL FROM")));
}

#[tokio::test]
async fn test_starttls_off_never_attempted() {
    let server = MockSmtpServer::start(ServerScript::default().advertise_starttls()).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);
    let options = VerifyOptions {
        starttls: Some(StartTlsMode::Off),
        ..Default::default()
    };

    service.verify_email("jane@corp.test", Some(&options)).await;
    assert!(!server.commands().iter().any(|c| c == "STARTTLS"));
}

#[tokio::test]
async fn test_read_timeout_is_unknown() {
    let server = MockSmtpServer::start(ServerScript::default().rcpt_delay(Duration::from_secs(2)))
        .await
        .unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);

    let outcome = service.verify_email("jane@corp.test", None).await;
    assert_eq!(outcome.result, Verdict::Unknown);
    let classification = outcome.smtp_details.unwrap().classification.unwrap();
    assert_eq!(classification.reason_code, ReasonCode::Timeout);
}

#[tokio::test]
async fn test_rejecting_banner_moves_to_next_host() {
    let closed = MockSmtpServer::start(ServerScript::default().banner(554, "5.7.1 Service refused"))
        .await
        .unwrap();
    let open = MockSmtpServer::start(ServerScript::default()).await.unwrap();
    let lookup = MockMxLookup::new().with_records(
        "corp.test",
        vec![
            MxRecord::new("127.0.0.1", 10, closed.port()),
            MxRecord::new("127.0.0.1", 20, open.port()),
        ],
    );
    let service = create_service(test_config(), lookup);

    let outcome = service.verify_email("jane@corp.test", None).await;
    assert_eq!(outcome.result, Verdict::Valid);
    assert_eq!(outcome.smtp_details.unwrap().hosts_tried.len(), 2);
}

#[tokio::test]
async fn test_rejecting_banner_alone_is_not_invalid() {
    let closed = MockSmtpServer::start(ServerScript::default().banner(554, "5.7.1 Service refused"))
        .await
        .unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", closed.port());
    let service = create_service(test_config(), lookup);

    let outcome = service.verify_email("jane@corp.test", None).await;
    assert_eq!(outcome.result, Verdict::Unknown);
    assert_eq!(
        outcome.smtp_details.unwrap().classification.unwrap().smtp_code,
        554
    );
}

#[tokio::test]
async fn test_identity_rotation_across_probes() {
    let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let mut config = test_config();
    config.enable_connection_pooling = false;
    let service = create_service(config, lookup);

    let first = service.verify_email("jane@corp.test", None).await;
    let second = service.verify_email("john@corp.test", None).await;

    let first = first.smtp_details.unwrap();
    let second = second.smtp_details.unwrap();
    assert_ne!(first.helo_domain, second.helo_domain);
    assert_ne!(first.from_address, second.from_address);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn test_helo_override_on_reused_connection() {
    let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let config = Arc::new(test_config());
    let rotation = Arc::new(RotationService::from_config(&config));
    let service = SmtpVerificationService::new(
        config.clone(),
        Arc::new(MxResolver::new(Arc::new(lookup), &config)),
        Arc::new(ConnectionPool::new(&config)),
        rotation.clone(),
        Arc::new(ProbeMetrics::new()),
    );
    let custom = VerifyOptions {
        helo_domain: Some("custom.example.com".to_string()),
        ..Default::default()
    };

    let first = service.verify_email("jane@corp.test", None).await;
    let second = service.verify_email("john@corp.test", Some(&custom)).await;
    let third = service.verify_email("jill@corp.test", None).await;

    let first = first.smtp_details.unwrap();
    let second = second.smtp_details.unwrap();
    let third = third.smtp_details.unwrap();
    assert_eq!(first.helo_domain.as_deref(), Some("a.probe.example.org"));
    assert_eq!(second.helo_domain.as_deref(), Some("custom.example.com"));
    assert!(second.reused_connection);
    assert_eq!(third.helo_domain.as_deref(), Some("b.probe.example.net"));
    assert_eq!(server.connection_count(), 1);

    let greetings: Vec<String> = server
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("EHLO"))
        .collect();
    assert_eq!(
        greetings,
        vec![
            "EHLO a.probe.example.org",
            "EHLO custom.example.com",
            "EHLO b.probe.example.net",
        ]
    );

    // The override was presented as given, not drawn from rotation
    let usage = rotation.usage_for("corp.test").unwrap();
    assert_eq!(usage.helo_usage_count, 2);
    assert_eq!(usage.from_usage_count, 3);
}

#[tokio::test]
async fn test_policy_block_is_not_invalid() {
    let server = MockSmtpServer::start(ServerScript::default().block("jane")).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);

    let outcome = service.verify_email("jane@corp.test", None).await;
    assert_eq!(outcome.result, Verdict::Unknown);
    assert!(outcome.reason.contains("blocked"));
}

#[tokio::test]
async fn test_metrics_snapshot() {
    init_tracing();
    let server = MockSmtpServer::start(ServerScript::default().reject("ghost")).await.unwrap();
    let lookup = MockMxLookup::new().with_local_server("corp.test", server.port());
    let service = create_service(test_config(), lookup);

    service.verify_email("jane@corp.test", None).await;
    service.verify_email("ghost@corp.test", None).await;

    let metrics = service.metrics();
    assert_eq!(metrics.probes, 2);
    assert_eq!(metrics.valid, 1);
    assert_eq!(metrics.invalid, 1);
    assert_eq!(metrics.conclusive_rate(), 1.0);
}

#[tokio::test]
#[ignore = "requires network access"]
async fn test_live_mx_lookup() {
    let lookup = DnsMxLookup::new(&ValidatorConfig::default());
    let records = lookup.lookup_mx("gmail.com").await.unwrap();
    assert!(!records.is_empty());
}
