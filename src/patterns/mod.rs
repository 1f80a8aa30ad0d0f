//! Syntax and heuristic checks on an email address.
//!
//! Everything here is pure and synchronous. Hard failures come back as a
//! `VerifyError` whose kind tells the caller why the address was refused;
//! soft signals (role accounts, suspicious patterns, mixed spam keywords,
//! typo suggestions when typos are not rejected) are collected in a
//! `PatternReport` and only affect the score.

mod lists;

use tracing::debug;

use crate::config::{PlusAddressingPolicy, ValidatorConfig, MAX_EMAIL_LENGTH};
use crate::errors::{VerifyError, VerifyErrorKind, VerifyResult};

pub use lists::{DISPOSABLE_DOMAINS, ROLE_ACCOUNTS, SPAM_KEYWORDS, TYPO_DOMAINS};

/// Maximum local part length (RFC 5321).
const MAX_LOCAL_LENGTH: usize = 64;

/// Maximum domain length (RFC 1035).
const MAX_DOMAIN_LENGTH: usize = 253;

/// Runs of the same character at least this long are suspicious.
const REPEAT_RUN: usize = 4;

/// Soft signals gathered from an address that passed the hard checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternReport {
    /// Local part as submitted.
    pub local_part: String,
    /// ASCII-compatible, lowercased domain.
    pub domain: String,
    /// Plus-addressing tag, if any.
    pub tag: Option<String>,
    /// Local part is a role account.
    pub role: bool,
    /// Local part shows a suspicious pattern.
    pub suspicious: bool,
    /// Descriptions of the suspicious patterns found.
    pub suspicious_reasons: Vec<String>,
    /// Local part mixes spam keywords with ordinary words.
    pub spam_keywords: bool,
    /// Domain is a known misspelling.
    pub typo: bool,
    /// Corrected domain for typos.
    pub suggestion: Option<String>,
}

impl PatternReport {
    /// Returns the address rebuilt from the normalized parts.
    pub fn normalized_email(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

/// Runs every format and heuristic check on an address.
pub fn check_email(email: &str, config: &ValidatorConfig) -> VerifyResult<PatternReport> {
    let email = email.trim();

    // Length goes first so oversized input is never scanned further.
    if email.chars().count() > MAX_EMAIL_LENGTH {
        return Err(VerifyError::new(
            VerifyErrorKind::LengthExceeded,
            format!("Email exceeds {} characters", MAX_EMAIL_LENGTH),
        ));
    }

    let (local, raw_domain) = split_address(email)?;
    check_local_part(local)?;
    let domain = normalize_domain(raw_domain)?;

    if is_placeholder(local, &domain) {
        return Err(VerifyError::format("Placeholder email address"));
    }

    if is_disposable(&domain) {
        return Err(VerifyError::new(
            VerifyErrorKind::DisposableDomain,
            format!("Disposable email domain {}", domain),
        ));
    }

    let mut report = PatternReport {
        local_part: local.to_string(),
        domain: domain.clone(),
        ..Default::default()
    };

    if let Some(correction) = typo_suggestion(&domain) {
        if config.reject_typo_domains {
            return Err(VerifyError::new(
                VerifyErrorKind::TypoDomain,
                format!("Domain {} looks like a typo", domain),
            )
            .with_suggestion(correction));
        }
        report.typo = true;
        report.suggestion = Some(correction.to_string());
    }

    let base = match local.split_once('+') {
        Some((base, tag)) => {
            if base.is_empty() || tag.is_empty() {
                return Err(VerifyError::format("Empty plus-addressing part"));
            }
            if config.plus_addressing_policy(&domain) == PlusAddressingPolicy::Deny {
                return Err(VerifyError::new(
                    VerifyErrorKind::PlusAddressing,
                    format!("{} does not support plus addressing", domain),
                ));
            }
            report.tag = Some(tag.to_string());
            base
        }
        None => local,
    };

    let ratio = spam_keyword_ratio(base);
    if ratio >= 1.0 {
        return Err(VerifyError::new(
            VerifyErrorKind::SpamKeywords,
            "Local part consists of spam keywords",
        ));
    }
    report.spam_keywords = ratio > 0.0;

    report.role = is_role_account(base);
    report.suspicious_reasons = suspicious_patterns(base);
    report.suspicious = !report.suspicious_reasons.is_empty();

    debug!(
        email = %email,
        role = report.role,
        suspicious = report.suspicious,
        spam_keywords = report.spam_keywords,
        typo = report.typo,
        "Pattern checks passed"
    );

    Ok(report)
}

/// Splits an address into local part and domain.
fn split_address(email: &str) -> VerifyResult<(&str, &str)> {
    if email.is_empty() {
        return Err(VerifyError::format("Email is empty"));
    }

    let (local, domain) = email
        .split_once('@')
        .ok_or_else(|| VerifyError::format("Email must contain @"))?;

    if domain.contains('@') {
        return Err(VerifyError::format("Email must contain exactly one @"));
    }
    if local.is_empty() {
        return Err(VerifyError::format("Local part is empty"));
    }
    if domain.is_empty() {
        return Err(VerifyError::format("Domain is empty"));
    }

    Ok((local, domain))
}

fn check_local_part(local: &str) -> VerifyResult<()> {
    if local.starts_with('"') {
        return Err(VerifyError::format("Quoted local parts are not accepted"));
    }
    if !local.is_ascii() {
        return Err(VerifyError::format("Local part contains non-ASCII characters"));
    }
    if local.len() > MAX_LOCAL_LENGTH {
        return Err(VerifyError::format(format!(
            "Local part exceeds {} characters",
            MAX_LOCAL_LENGTH
        )));
    }
    if let Some(c) = local
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-')))
    {
        return Err(VerifyError::format(format!(
            "Local part contains invalid character {:?}",
            c
        )));
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(VerifyError::format("Misplaced dot in local part"));
    }
    Ok(())
}

/// Converts a domain to lowercase ASCII-compatible encoding and checks its labels.
pub fn normalize_domain(domain: &str) -> VerifyResult<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|e| VerifyError::format(format!("Invalid international domain: {:?}", e)))?
        .to_ascii_lowercase();

    if ascii.is_empty() || ascii.len() > MAX_DOMAIN_LENGTH {
        return Err(VerifyError::format("Invalid domain length"));
    }

    let labels: Vec<&str> = ascii.split('.').collect();
    if labels.len() < 2 {
        return Err(VerifyError::format("Domain must have a top-level domain"));
    }

    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(VerifyError::format("Invalid domain label length"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(VerifyError::format("Domain label starts or ends with hyphen"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(VerifyError::format("Domain contains invalid characters"));
        }
    }

    let tld = labels[labels.len() - 1];
    if tld.len() < 2 || !(tld.chars().all(|c| c.is_ascii_alphabetic()) || tld.starts_with("xn--")) {
        return Err(VerifyError::format("Invalid top-level domain"));
    }

    Ok(ascii)
}

fn is_placeholder(local: &str, domain: &str) -> bool {
    let local = local.to_ascii_lowercase();
    lists::PLACEHOLDER_DOMAINS.contains(&domain) || lists::PLACEHOLDER_LOCALS.contains(&local.as_str())
}

/// Returns true if the domain or one of its parents is a disposable provider.
pub fn is_disposable(domain: &str) -> bool {
    DISPOSABLE_DOMAINS.iter().any(|d| {
        domain == *d
            || domain
                .strip_suffix(d)
                .map_or(false, |prefix| prefix.ends_with('.'))
    })
}

/// Returns the corrected domain if this one is a known misspelling.
pub fn typo_suggestion(domain: &str) -> Option<&'static str> {
    TYPO_DOMAINS
        .iter()
        .find(|(typo, _)| *typo == domain)
        .map(|(_, correction)| *correction)
}

/// Returns true if the local part names a shared mailbox.
pub fn is_role_account(local: &str) -> bool {
    let local = local.to_ascii_lowercase();
    ROLE_ACCOUNTS.contains(&local.as_str())
}

/// Share of alphabetic tokens in the local part that are spam keywords.
///
/// `0.0` when the local part has no alphabetic tokens.
pub fn spam_keyword_ratio(local: &str) -> f64 {
    let lower = local.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.is_empty() {
        return 0.0;
    }

    let spam = tokens.iter().filter(|t| SPAM_KEYWORDS.contains(t)).count();
    spam as f64 / tokens.len() as f64
}

/// Describes every suspicious pattern found in a local part.
pub fn suspicious_patterns(local: &str) -> Vec<String> {
    let lower = local.to_ascii_lowercase();
    let mut reasons = Vec::new();

    if lower.chars().filter(|c| c.is_ascii_alphanumeric()).count() == 1 {
        reasons.push("Single character local part".to_string());
    }

    if has_repeated_run(&lower) {
        reasons.push("Repeated characters".to_string());
    }

    if let Some(seq) = find_sequence(&lower) {
        reasons.push(format!("Sequential pattern {:?}", seq));
    }

    reasons
}

fn has_repeated_run(s: &str) -> bool {
    let mut run = 0;
    let mut prev = None;
    for c in s.chars() {
        if Some(c) == prev && c.is_ascii_alphanumeric() {
            run += 1;
            if run >= REPEAT_RUN {
                return true;
            }
        } else {
            run = 1;
            prev = Some(c);
        }
    }
    false
}

fn find_sequence(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if bytes.len() < REPEAT_RUN {
        return None;
    }
    bytes.windows(REPEAT_RUN).find_map(|w| {
        let window = std::str::from_utf8(w).ok()?;
        lists::SEQUENCES
            .iter()
            .any(|seq| seq.contains(window))
            .then(|| window.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ValidatorConfig {
        ValidatorConfig::default()
    }

    #[test]
    fn test_accepts_ordinary_address() {
        let report = check_email("  jane.smith@gmail.com ", &config()).unwrap();
        assert_eq!(report.local_part, "jane.smith");
        assert_eq!(report.domain, "gmail.com");
        assert!(!report.role);
        assert!(!report.suspicious);
        assert!(!report.spam_keywords);
        assert_eq!(report.normalized_email(), "jane.smith@gmail.com");
    }

    #[test]
    fn test_rejects_overlong_address_first() {
        let email = format!("{}@example.org", "a".repeat(260));
        let err = check_email(&email, &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::LengthExceeded);
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        for email in [
            "",
            "no-at-sign",
            "two@@ats.com",
            "@nolocal.com",
            "nodomain@",
            "\"quoted\"@gmail.com",
            "sp ace@gmail.com",
            ".dot@gmail.com",
            "dot.@gmail.com",
            "do..t@gmail.com",
            "jane@localhost",
            "jane@-bad.com",
            "jane@bad_domain.com",
            "jane@domain.c",
        ] {
            let err = check_email(email, &config()).unwrap_err();
            assert_eq!(err.kind(), VerifyErrorKind::Format, "{email}");
        }
    }

    #[test]
    fn test_rejects_non_ascii_local_part() {
        let err = check_email("jösé@gmail.com", &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::Format);
    }

    #[test]
    fn test_normalizes_international_domain() {
        assert_eq!(normalize_domain("Bücher.DE").unwrap(), "xn--bcher-kva.de");
        let report = check_email("kontakt@bücher.de", &config()).unwrap();
        assert_eq!(report.domain, "xn--bcher-kva.de");
    }

    #[test]
    fn test_disposable_domain_and_subdomain() {
        let err = check_email("someone@mailinator.com", &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::DisposableDomain);
        assert!(is_disposable("inbox.mailinator.com"));
        assert!(!is_disposable("notmailinator.com"));
    }

    #[test]
    fn test_typo_domain_rejected_with_suggestion() {
        let err = check_email("jane@gmial.com", &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::TypoDomain);
        assert_eq!(err.suggestion(), Some("gmail.com"));
    }

    #[test]
    fn test_typo_domain_soft_when_not_rejected() {
        let config = ValidatorConfig {
            reject_typo_domains: false,
            ..Default::default()
        };
        let report = check_email("jane@hotmial.com", &config).unwrap();
        assert!(report.typo);
        assert_eq!(report.suggestion.as_deref(), Some("hotmail.com"));
    }

    #[test]
    fn test_placeholder_addresses() {
        for email in ["test@gmail.com", "jane@example.com", "noemail@outlook.com"] {
            let err = check_email(email, &config()).unwrap_err();
            assert_eq!(err.kind(), VerifyErrorKind::Format, "{email}");
        }
    }

    #[test]
    fn test_spam_keywords_ratio() {
        assert_eq!(spam_keyword_ratio("casino.winner"), 1.0);
        assert_eq!(spam_keyword_ratio("free.consulting"), 0.5);
        assert_eq!(spam_keyword_ratio("12345"), 0.0);

        let err = check_email("casino.winner@gmail.com", &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::SpamKeywords);

        let report = check_email("free.consulting@gmail.com", &config()).unwrap();
        assert!(report.spam_keywords);
    }

    #[test]
    fn test_plus_addressing_table() {
        let report = check_email("jane+news@gmail.com", &config()).unwrap();
        assert_eq!(report.tag.as_deref(), Some("news"));

        let err = check_email("jane+news@aol.com", &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::PlusAddressing);

        let err = check_email("jane+@gmail.com", &config()).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::Format);

        // Unlisted providers allow tags
        assert!(check_email("jane+x@acme-mail.net", &config()).is_ok());
    }

    #[test]
    fn test_role_accounts() {
        assert!(is_role_account("Support"));
        assert!(!is_role_account("jane"));
        let report = check_email("postmaster@acme-mail.net", &config()).unwrap();
        assert!(report.role);
    }

    #[test]
    fn test_suspicious_patterns() {
        assert!(suspicious_patterns("j").contains(&"Single character local part".to_string()));
        assert!(suspicious_patterns("aaaab").contains(&"Repeated characters".to_string()));
        assert!(!suspicious_patterns("aaab").contains(&"Repeated characters".to_string()));
        assert_eq!(suspicious_patterns("qwerty77").len(), 1);
        assert_eq!(suspicious_patterns("mary1234").len(), 1);
        assert!(suspicious_patterns("jane.smith").is_empty());

        let report = check_email("x@gmail.com", &config()).unwrap();
        assert!(report.suspicious);
    }
}
