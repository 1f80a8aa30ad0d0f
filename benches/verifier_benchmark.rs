//! Benchmarks for the pure verification layers:
//! - Pattern checks on ordinary and hostile addresses
//! - SMTP reply classification
//! - Reply parsing
#![allow(clippy::unwrap_used)]

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mailprobe::protocol::SmtpResponse;
use mailprobe::{check_email, classify, ValidatorConfig};

fn bench_pattern_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_checks");
    let config = ValidatorConfig::default();
    let long = format!("{}@example.net", "a".repeat(300));

    let addresses = vec![
        ("jane.smith@gmail.com", "ordinary"),
        ("sales.team+q3@outlook.com", "role with tag"),
        ("winner.free.cash@corp.example.net", "spam keywords"),
        ("jane@gmial.com", "typo domain"),
        ("user@bücher.example", "international domain"),
        (long.as_str(), "oversized"),
    ];

    for (email, desc) in addresses {
        group.throughput(Throughput::Bytes(email.len() as u64));
        group.bench_with_input(BenchmarkId::new("check_email", desc), &email, |b, &email| {
            b.iter(|| black_box(check_email(black_box(email), &config)));
        });
    }

    group.finish();
}

fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");

    let replies = vec![
        (250, "2.1.5 Recipient OK", "accepted"),
        (550, "5.1.1 User unknown", "invalid user"),
        (451, "4.7.1 Greylisted, try again later", "greylisted"),
        (554, "5.7.1 Service unavailable; client host blocked using Spamhaus", "blocked"),
        (421, "Too many connections, slow down", "rate limited"),
    ];

    for (code, text, desc) in replies {
        let raw = format!("{} {}", code, text);
        group.bench_with_input(BenchmarkId::new("classify", desc), &text, |b, &text| {
            b.iter(|| black_box(classify(code, black_box(text), &raw)));
        });
    }

    group.finish();
}

fn bench_reply_parsing(c: &mut Criterion) {
    let lines: Vec<String> = vec![
        "250-mx.example.net Hello".to_string(),
        "250-PIPELINING".to_string(),
        "250-SIZE 35882577".to_string(),
        "250-STARTTLS".to_string(),
        "250-ENHANCEDSTATUSCODES".to_string(),
        "250 SMTPUTF8".to_string(),
    ];

    c.bench_function("parse_ehlo_reply", |b| {
        b.iter(|| black_box(SmtpResponse::parse(black_box(&lines)).unwrap()));
    });
}

criterion_group!(benches, bench_pattern_checks, bench_classification, bench_reply_parsing);
criterion_main!(benches);
