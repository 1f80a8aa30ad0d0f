//! SMTP reply classification.
//!
//! `classify` maps a status code and reply text to a three-way verdict.
//! The code family decides the base verdict; the reply text is then scanned
//! against pattern groups that add a severity and a remediation hint.
//! Only greylisting overrides the verdict here. A 5xx policy block stays
//! `invalid`/`server_reject`; `is_policy_block` lets the caller decide how
//! much to trust it.

use crate::errors::EnhancedStatusCode;
use crate::types::{MessageAnalysis, ReasonCode, Severity, SmtpClassification, Verdict};

/// A named set of reply text fragments.
#[derive(Debug, Clone, Copy)]
pub struct PatternGroup {
    /// Group name reported in `detected_issues`.
    pub name: &'static str,
    /// Lowercase fragments, any of which matches.
    pub patterns: &'static [&'static str],
    /// Severity of a match.
    pub severity: Severity,
    /// Suggested remediation.
    pub hint: &'static str,
}

/// Pattern groups, checked in order. The first matching group supplies the hint.
pub const PATTERN_GROUPS: &[PatternGroup] = &[
    PatternGroup {
        name: "greylisted",
        patterns: &[
            "greylist",
            "graylist",
            "grey-list",
            "gray-list",
            "try again later",
            "please retry",
            "temporarily deferred",
            "deferred",
        ],
        severity: Severity::Medium,
        hint: "retry_later",
    },
    PatternGroup {
        name: "blocked",
        patterns: &[
            "blocked",
            "blacklist",
            "blocklist",
            "denylist",
            "spamhaus",
            "barracuda",
            "spamcop",
            "listed at",
            "poor reputation",
            "banned",
        ],
        severity: Severity::High,
        hint: "ip_rotation",
    },
    PatternGroup {
        name: "rate_limited",
        patterns: &[
            "rate limit",
            "too many",
            "limit exceeded",
            "throttl",
            "slow down",
            "too fast",
        ],
        severity: Severity::Medium,
        hint: "delay_and_retry",
    },
    PatternGroup {
        name: "connection_issues",
        patterns: &[
            "connection refused",
            "connection reset",
            "connection timed out",
            "lost connection",
            "closing connection",
        ],
        severity: Severity::Medium,
        hint: "retry_with_backoff",
    },
    PatternGroup {
        name: "server_busy",
        patterns: &[
            "server busy",
            "system busy",
            "overloaded",
            "resources temporarily",
            "insufficient system resources",
            "service not available",
            "service unavailable",
        ],
        severity: Severity::Low,
        hint: "retry_later",
    },
    PatternGroup {
        name: "authentication_issues",
        patterns: &[
            "authentication required",
            "not authenticated",
            "authentication failed",
            "spf",
            "dkim",
            "dmarc",
            "reverse dns",
            "ptr record",
            "helo",
        ],
        severity: Severity::High,
        hint: "check_sender_configuration",
    },
];

const INVALID_USER_PATTERNS: &[&str] = &[
    "user unknown",
    "unknown user",
    "no such user",
    "user not found",
    "mailbox not found",
    "mailbox unavailable",
    "mailbox does not exist",
    "does not exist",
    "recipient not found",
    "unknown recipient",
    "invalid recipient",
    "recipient rejected",
    "address rejected",
    "no mailbox",
    "not a valid mailbox",
    "account disabled",
    "account has been disabled",
];

const RELAY_PATTERNS: &[&str] = &["relay", "relaying"];

/// Classifies one SMTP reply.
///
/// `text` is the reply text without the status code; `raw_line` is the full
/// line as received and is only used to find an enhanced status code when
/// the text does not carry one. Pure and deterministic.
pub fn classify(code: u16, text: &str, raw_line: &str) -> SmtpClassification {
    let lower = text.to_lowercase();
    let enhanced = EnhancedStatusCode::find_in(text).or_else(|| EnhancedStatusCode::find_in(raw_line));
    let analysis = analyze_message(&lower);

    let (mut result, mut reason_code) = match code {
        200..=299 | 354 => (Verdict::Valid, ReasonCode::Accepted),
        400..=499 => (Verdict::Unknown, classify_transient(code, enhanced.as_ref())),
        500..=599 => (Verdict::Invalid, classify_permanent(code, &lower, enhanced.as_ref())),
        _ => (Verdict::Unknown, ReasonCode::Unclassified),
    };

    if let Some(analysis) = &analysis {
        let has = |name: &str| analysis.detected_issues.iter().any(|i| i == name);

        if has("greylisted") && result != Verdict::Valid {
            result = Verdict::Unknown;
            reason_code = ReasonCode::Greylisted;
        } else if has("blocked")
            && result == Verdict::Invalid
            && !names_mailbox(&lower, enhanced.as_ref())
        {
            reason_code = ReasonCode::ServerReject;
        }
    }

    let server_hint = analysis.as_ref().and_then(|a| {
        PATTERN_GROUPS
            .iter()
            .find(|g| a.detected_issues.iter().any(|i| i == g.name))
            .map(|g| g.hint.to_string())
    });

    SmtpClassification {
        result,
        reason_code,
        smtp_code: code,
        detail: text.trim().to_string(),
        message_analysis: analysis,
        server_hint,
    }
}

/// True for a 5xx rejection that blames the sender rather than the mailbox.
pub fn is_policy_block(classification: &SmtpClassification) -> bool {
    classification.result == Verdict::Invalid
        && classification.reason_code == ReasonCode::ServerReject
        && classification
            .message_analysis
            .as_ref()
            .map_or(false, |a| a.detected_issues.iter().any(|i| i == "blocked"))
}

fn classify_transient(code: u16, enhanced: Option<&EnhancedStatusCode>) -> ReasonCode {
    match (code, enhanced.map(|e| (e.subject, e.detail))) {
        (421, _) => ReasonCode::ServiceUnavailable,
        (450, _) => ReasonCode::MailboxBusy,
        (452, _) | (_, Some((2, 2))) => ReasonCode::MailboxFull,
        _ => ReasonCode::TemporaryFailure,
    }
}

/// True if the reply explicitly says the mailbox does not exist.
fn names_mailbox(lower: &str, enhanced: Option<&EnhancedStatusCode>) -> bool {
    matches!(enhanced, Some(e) if e.subject == 1 && e.detail == 1)
        || contains_any(lower, INVALID_USER_PATTERNS)
}

fn classify_permanent(code: u16, lower: &str, enhanced: Option<&EnhancedStatusCode>) -> ReasonCode {
    let esc = enhanced.map(|e| (e.subject, e.detail));

    if names_mailbox(lower, enhanced) {
        return ReasonCode::InvalidUser;
    }
    if contains_any(lower, RELAY_PATTERNS) {
        return ReasonCode::RelayDenied;
    }
    match (code, esc) {
        (551, _) => ReasonCode::UserNotLocal,
        (552, _) | (_, Some((2, 2))) => ReasonCode::MailboxFull,
        (553, _) | (501, _) | (_, Some((1, 3))) => ReasonCode::InvalidAddressSyntax,
        (550, None) => ReasonCode::InvalidUser,
        _ => ReasonCode::ServerReject,
    }
}

/// Scans a reply text against every pattern group.
///
/// Returns `None` when nothing matched.
pub fn analyze_message(text: &str) -> Option<MessageAnalysis> {
    let lower = text.to_lowercase();
    let matched: Vec<&PatternGroup> = PATTERN_GROUPS
        .iter()
        .filter(|g| contains_any(&lower, g.patterns))
        .collect();

    let severity = matched.iter().map(|g| g.severity).max()?;
    Some(MessageAnalysis {
        severity,
        detected_issues: matched.iter().map(|g| g.name.to_string()).collect(),
    })
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(250, "2.1.5 Recipient OK", Verdict::Valid, ReasonCode::Accepted)]
    #[case(251, "User not local; will forward", Verdict::Valid, ReasonCode::Accepted)]
    #[case(354, "Start mail input", Verdict::Valid, ReasonCode::Accepted)]
    #[case(421, "4.3.2 Service shutting down", Verdict::Unknown, ReasonCode::ServiceUnavailable)]
    #[case(450, "4.2.1 Mailbox temporarily unavailable", Verdict::Unknown, ReasonCode::MailboxBusy)]
    #[case(451, "4.3.0 Local error in processing", Verdict::Unknown, ReasonCode::TemporaryFailure)]
    #[case(452, "4.2.2 Mailbox full", Verdict::Unknown, ReasonCode::MailboxFull)]
    #[case(550, "User unknown", Verdict::Invalid, ReasonCode::InvalidUser)]
    #[case(550, "5.1.1 <nobody@example.org>: Recipient address rejected", Verdict::Invalid, ReasonCode::InvalidUser)]
    #[case(554, "5.7.1 Relay access denied", Verdict::Invalid, ReasonCode::RelayDenied)]
    #[case(551, "User not local; please try <other@example.org>", Verdict::Invalid, ReasonCode::UserNotLocal)]
    #[case(552, "5.2.2 Quota exceeded for this mailbox", Verdict::Invalid, ReasonCode::MailboxFull)]
    #[case(553, "5.1.3 Bad recipient address syntax", Verdict::Invalid, ReasonCode::InvalidAddressSyntax)]
    #[case(554, "Transaction failed", Verdict::Invalid, ReasonCode::ServerReject)]
    fn test_classify_by_code(
        #[case] code: u16,
        #[case] text: &str,
        #[case] result: Verdict,
        #[case] reason: ReasonCode,
    ) {
        let c = classify(code, text, &format!("{} {}", code, text));
        assert_eq!(c.result, result, "{code} {text}");
        assert_eq!(c.reason_code, reason, "{code} {text}");
        assert_eq!(c.smtp_code, code);
    }

    #[test]
    fn test_greylisting_overrides_code() {
        let c = classify(451, "greylisted, try again later", "451 greylisted, try again later");
        assert_eq!(c.result, Verdict::Unknown);
        assert_eq!(c.reason_code, ReasonCode::Greylisted);
        assert_eq!(c.server_hint.as_deref(), Some("retry_later"));

        // Even a 5xx is not a verdict when the server says it is greylisting
        let c = classify(550, "Greylisted for 5 minutes", "550 Greylisted for 5 minutes");
        assert_eq!(c.result, Verdict::Unknown);
        assert_eq!(c.reason_code, ReasonCode::Greylisted);
    }

    #[test]
    fn test_policy_block_stays_permanent() {
        let text = "5.7.1 Service unavailable; client host blocked using Spamhaus";
        let c = classify(554, text, text);
        assert_eq!(c.result, Verdict::Invalid);
        assert_eq!(c.reason_code, ReasonCode::ServerReject);
        assert_eq!(c.server_hint.as_deref(), Some("ip_rotation"));
        assert!(is_policy_block(&c));
        let analysis = c.message_analysis.unwrap();
        assert_eq!(analysis.severity, Severity::High);
        assert!(analysis.detected_issues.contains(&"blocked".to_string()));
        assert!(analysis.detected_issues.contains(&"server_busy".to_string()));

        let c = classify(550, "Blocked by Spamhaus", "550 Blocked by Spamhaus");
        assert_eq!(c.result, Verdict::Invalid);
        assert_eq!(c.reason_code, ReasonCode::ServerReject);
        assert_eq!(c.server_hint.as_deref(), Some("ip_rotation"));
        assert!(is_policy_block(&c));

        // Mailbox evidence wins over the block text
        let c = classify(550, "5.1.1 User unknown; sender blocked", "");
        assert_eq!(c.result, Verdict::Invalid);
        assert_eq!(c.reason_code, ReasonCode::InvalidUser);
        assert!(!is_policy_block(&c));
    }

    #[rstest]
    #[case(500, "Syntax error")]
    #[case(550, "Blocked by Spamhaus")]
    #[case(553, "Listed at barracuda")]
    #[case(554, "Transaction failed")]
    fn test_permanent_codes_are_invalid(#[case] code: u16, #[case] text: &str) {
        assert_eq!(classify(code, text, "").result, Verdict::Invalid);
    }

    #[test]
    fn test_rate_limit_hint() {
        let c = classify(421, "Too many connections from your IP", "");
        assert_eq!(c.result, Verdict::Unknown);
        assert_eq!(c.reason_code, ReasonCode::ServiceUnavailable);
        assert_eq!(c.server_hint.as_deref(), Some("delay_and_retry"));
    }

    #[test]
    fn test_enhanced_code_from_raw_line() {
        let c = classify(550, "Rejected", "550 5.1.1 Rejected");
        assert_eq!(c.reason_code, ReasonCode::InvalidUser);
        let c = classify(550, "Rejected", "550 5.7.0 Rejected");
        assert_eq!(c.reason_code, ReasonCode::ServerReject);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let a = classify(550, "User unknown", "550 User unknown");
        let b = classify(550, "User unknown", "550 User unknown");
        assert_eq!(a, b);
        assert!(a.message_analysis.is_none());
        assert!(a.server_hint.is_none());
    }

    #[test]
    fn test_analyze_message_no_match() {
        assert!(analyze_message("OK").is_none());
    }
}
