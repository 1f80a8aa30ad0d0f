//! Address Verification Example
//!
//! This example demonstrates how to:
//! - Configure the validator with a sender identity pool
//! - Validate a batch of addresses against live mail exchangers
//! - Read per-address scores and reasons
//! - Inspect cache, pool and probe statistics
//!
//! Usage: `cargo run --example verify -- jane@example.org john@example.net`
//!
//! Outbound port 25 must be reachable and the HELO domains should resolve
//! back to the probing host, or many exchangers will refuse the connection.

use mailprobe::{EmailValidationService, StartTlsMode, ValidatorConfig, VerifyResult};
use std::time::Duration;

#[tokio::main]
async fn main() -> VerifyResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut emails: Vec<String> = std::env::args().skip(1).collect();
    if emails.is_empty() {
        emails = vec![
            "postmaster@gmail.com".to_string(),
            "jane@gmial.com".to_string(),
            "someone@mailinator.com".to_string(),
        ];
    }

    // Identities the probes rotate through
    let config = ValidatorConfig::builder()
        .batch_size(5)
        .connect_timeout(Duration::from_secs(8))
        .read_timeout(Duration::from_secs(8))
        .helo_domains(["mx1.probe.example.org", "mx2.probe.example.org"])
        .from_addresses(["verify@probe.example.org", "bounce@probe.example.net"])
        .starttls(StartTlsMode::Auto)
        .build()?;

    let service = EmailValidationService::new(config)?;
    service.start();

    println!("Validating {} address(es)...", emails.len());
    let results = service.validate_batch(&emails, Some("demo")).await;

    for result in &results {
        println!(
            "\n{} -> valid={} score={} ({} ms)",
            result.email, result.valid, result.score, result.processing_time_ms
        );
        if let Some(suggestion) = &result.suggestion {
            println!("  did you mean {}?", suggestion);
        }
        for reason in &result.reason {
            println!("  - {}", reason);
        }
    }

    let stats = EmailValidationService::calculate_statistics(&results);
    println!(
        "\n=== Batch ===\nvalid {}/{} ({}%), unknown {}, average score {}",
        stats.valid, stats.total, stats.valid_percentage, stats.unknown, stats.average_score
    );

    let cache = service.get_cache_statistics();
    println!("\n=== Engine ===");
    println!(
        "MX cache: {} entries, hit rate {:.2}",
        cache.mx_cache.size, cache.mx_cache.hit_rate
    );
    println!(
        "Pool: {} exchanger(s), {} connection(s)",
        cache.pool.pools, cache.pool.total_connections
    );
    println!(
        "Probes: {} total, {} greylisted, {} TLS upgrades",
        cache.probes.probes, cache.probes.greylisted, cache.probes.tls_upgrades
    );

    service.shutdown();
    Ok(())
}
