//! Core types shared by every layer of the verification engine.
//!
//! This module provides:
//! - The per-email `ValidationResult` and its detail flags
//! - MX records and the three-way SMTP classification
//! - Statistics snapshots for the cache, the pool and batch results

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::observability::MetricsSnapshot;

/// Three-way outcome of a mailbox probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Server accepted the recipient.
    Valid,
    /// Server rejected the recipient permanently.
    Invalid,
    /// No conclusive answer (transient failure, greylisting, unreachable host).
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Valid => write!(f, "valid"),
            Verdict::Invalid => write!(f, "invalid"),
            Verdict::Unknown => write!(f, "unknown"),
        }
    }
}

/// Fine-grained reason attached to a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Recipient accepted (2xx / 354).
    Accepted,
    /// 421 and similar: service not available.
    ServiceUnavailable,
    /// 450: mailbox busy or temporarily unavailable.
    MailboxBusy,
    /// Generic temporary failure.
    TemporaryFailure,
    /// Mailbox over quota (452 / 552).
    MailboxFull,
    /// Server deferred the sender on purpose.
    Greylisted,
    /// Mailbox does not exist.
    InvalidUser,
    /// Server refuses to relay for this recipient.
    RelayDenied,
    /// 551: user not local.
    UserNotLocal,
    /// Recipient address syntax rejected by the server.
    InvalidAddressSyntax,
    /// Permanent rejection for a reason other than the mailbox.
    ServerReject,
    /// Sender or client IP blocked by the server.
    Blocked,
    /// Nothing matched.
    Unclassified,
    /// Could not reach any mail exchanger.
    ConnectionFailed,
    /// A step timed out.
    Timeout,
}

impl ReasonCode {
    /// Returns the wire name of the reason code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Accepted => "accepted",
            ReasonCode::ServiceUnavailable => "service_unavailable",
            ReasonCode::MailboxBusy => "mailbox_busy",
            ReasonCode::TemporaryFailure => "temporary_failure",
            ReasonCode::MailboxFull => "mailbox_full",
            ReasonCode::Greylisted => "greylisted",
            ReasonCode::InvalidUser => "invalid_user",
            ReasonCode::RelayDenied => "relay_denied",
            ReasonCode::UserNotLocal => "user_not_local",
            ReasonCode::InvalidAddressSyntax => "invalid_address_syntax",
            ReasonCode::ServerReject => "server_reject",
            ReasonCode::Blocked => "blocked",
            ReasonCode::Unclassified => "unclassified",
            ReasonCode::ConnectionFailed => "connection_failed",
            ReasonCode::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of the issues detected in a reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth slowing down for.
    Medium,
    /// The sender identity or IP is likely burned for this server.
    High,
}

/// Issues detected in the free text of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAnalysis {
    /// Highest severity among detected issues.
    pub severity: Severity,
    /// Names of the pattern groups that matched.
    pub detected_issues: Vec<String>,
}

/// Output of the message analyzer for one SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpClassification {
    /// Three-way result.
    pub result: Verdict,
    /// Finer-grained reason.
    pub reason_code: ReasonCode,
    /// SMTP status code the classification is based on.
    pub smtp_code: u16,
    /// Reply text.
    pub detail: String,
    /// Text analysis, when any pattern group matched.
    pub message_analysis: Option<MessageAnalysis>,
    /// Suggested remediation (`ip_rotation`, `delay_and_retry`, ...).
    pub server_hint: Option<String>,
}

impl SmtpClassification {
    /// Builds a classification for a failure that produced no SMTP reply.
    pub fn unreachable(reason_code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            result: Verdict::Unknown,
            reason_code,
            smtp_code: 0,
            detail: detail.into(),
            message_analysis: None,
            server_hint: None,
        }
    }
}

/// Mail exchanger record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MxRecord {
    /// Exchanger host name (no trailing dot) or IP literal.
    pub exchange: String,
    /// Preference, lower is tried first.
    pub priority: u16,
    /// SMTP port of the exchanger.
    pub port: u16,
}

impl MxRecord {
    /// Creates a new record.
    pub fn new(exchange: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            exchange: exchange.into(),
            priority,
            port,
        }
    }

    /// Returns the `host:port` address of the exchanger.
    pub fn address(&self) -> String {
        format!("{}:{}", self.exchange, self.port)
    }
}

/// MX records with cache provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxLookupResult {
    /// Records sorted by ascending priority.
    pub records: Vec<MxRecord>,
    /// True if served from the MX cache.
    pub from_cache: bool,
}

/// Per-check flags of a validation result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetails {
    /// Syntax checks passed.
    pub format: bool,
    /// MX (or fallback A) records exist.
    pub mx: bool,
    /// SMTP probe accepted the mailbox, or probing was bypassed.
    pub smtp: bool,
    /// Domain is a disposable provider.
    pub disposable: bool,
    /// Local part is a role account.
    pub role: bool,
    /// Domain looks like a typo.
    pub typo: bool,
    /// Local part shows a suspicious pattern.
    pub suspicious: bool,
    /// Local part contains spam keywords.
    pub spam_keywords: bool,
}

/// Result of validating one email address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Address as submitted (trimmed).
    pub email: String,
    /// Overall verdict.
    pub valid: bool,
    /// Deliverability score 0..=100.
    pub score: u8,
    /// Human-readable reasons, in the order they were found.
    pub reason: Vec<String>,
    /// Individual check flags.
    pub details: ValidationDetails,
    /// Suggested correction for typo domains.
    pub suggestion: Option<String>,
    /// Wall-clock processing time.
    pub processing_time_ms: u64,
    /// MX data came from the cache.
    pub from_cache: bool,
    /// An SMTP probe was actually attempted.
    pub smtp_attempted: bool,
    /// Three-way SMTP result, when a probe ran.
    pub smtp_result: Option<Verdict>,
    /// Domain accepts any recipient.
    pub catch_all: bool,
    /// When the validation finished.
    pub checked_at: DateTime<Utc>,
}

/// Protocol-level details of an SMTP verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpDetails {
    /// Exchanger that produced the final answer.
    pub mx_host: Option<String>,
    /// Exchangers contacted, in order.
    pub hosts_tried: Vec<String>,
    /// HELO domain presented.
    pub helo_domain: Option<String>,
    /// MAIL FROM address presented.
    pub from_address: Option<String>,
    /// STARTTLS was negotiated.
    pub tls: bool,
    /// Connection came from the pool.
    pub reused_connection: bool,
    /// Final classification.
    pub classification: Option<SmtpClassification>,
    /// `C:`/`S:` transcript (verbose mode only).
    pub transcript: Vec<String>,
}

/// Outcome of `SmtpVerificationService::verify_email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpVerification {
    /// True only when the result is `valid`.
    pub valid: bool,
    /// Three-way result.
    pub result: Verdict,
    /// Human-readable reason.
    pub reason: String,
    /// MX records used, when resolution succeeded.
    pub mx_records: Option<Vec<MxRecord>>,
    /// Protocol details, when a probe ran.
    pub smtp_details: Option<SmtpDetails>,
    /// Domain accepts any recipient.
    pub catch_all: bool,
}

/// Aggregate counts over a set of validation results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStatistics {
    /// Number of results.
    pub total: usize,
    /// Valid results.
    pub valid: usize,
    /// Invalid results.
    pub invalid: usize,
    /// Results whose SMTP probe was inconclusive.
    pub unknown: usize,
    /// Valid share in percent, two decimals.
    pub valid_percentage: f64,
    /// Invalid share in percent, two decimals.
    pub invalid_percentage: f64,
    /// Mean score.
    pub average_score: f64,
}

/// MX cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MxCacheStats {
    /// Entries currently held (including not yet evicted expired ones).
    pub size: usize,
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// hits / (hits + misses), 0 when nothing was looked up.
    pub hit_rate: f64,
}

/// Connection pool status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Number of host buckets.
    pub pools: usize,
    /// Retained connections across all buckets.
    pub total_connections: usize,
    /// Idle retained connections.
    pub available_connections: usize,
    /// Retained connections currently checked out.
    pub in_use_connections: usize,
    /// Short-lived connections opened past the per-host cap.
    pub overflow_connections: u64,
    /// Per-host retained connection counts.
    pub per_host: HashMap<String, usize>,
}

/// Combined cache and pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    /// MX cache.
    pub mx_cache: MxCacheStats,
    /// Connection pool.
    pub pool: PoolStats,
    /// Domains tracked by the rotation service.
    pub rotation_tracked_domains: usize,
    /// Probe counters.
    pub probes: MetricsSnapshot,
}
