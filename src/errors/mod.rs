//! Error types for the verification engine.
//!
//! One error struct carries a kind from the verification taxonomy plus the
//! SMTP status (basic and enhanced) that produced it, so callers can tell a
//! confirmed mailbox rejection apart from a transient or ambiguous failure.

use std::fmt;
use thiserror::Error;

/// Result type for verification operations.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Verification error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyErrorKind {
    // Address-level failures
    /// Address syntax is not acceptable.
    Format,
    /// Address exceeds the maximum accepted length.
    LengthExceeded,
    /// Domain belongs to a disposable mailbox provider.
    DisposableDomain,
    /// Domain looks like a misspelling of a well-known provider.
    TypoDomain,
    /// Local part consists of spam keywords only.
    SpamKeywords,
    /// Plus-addressing used on a provider that does not honour tags.
    PlusAddressing,

    // DNS failures
    /// Neither MX nor A records exist for the domain.
    NoMxRecord,
    /// DNS lookup failed for another reason (timeout, SERVFAIL).
    DnsLookup,

    // SMTP failures
    /// TCP connect to the mail exchanger failed.
    SmtpConnect,
    /// A connect or read step exceeded its timeout.
    SmtpTimeout,
    /// Server rejected the mailbox with a permanent (5xx) reply.
    SmtpPermanentReject,
    /// Server answered with a temporary (4xx) reply.
    SmtpTransientReject,
    /// Server is greylisting the sender.
    Greylisted,
    /// Reply could not be matched to any classification rule.
    UnknownClassification,

    // Connection state
    /// Command issued without an open connection.
    NotConnected,
    /// STARTTLS required but not offered.
    TlsUnavailable,
    /// TLS handshake failed.
    TlsHandshake,
    /// Malformed or unexpected protocol exchange.
    Protocol,

    // Pool
    /// No pooled connection could be obtained in time.
    PoolExhausted,

    // Configuration
    /// Configuration is invalid.
    Configuration,
}

impl VerifyErrorKind {
    /// Returns true if retrying (possibly against another MX host) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerifyErrorKind::SmtpConnect
                | VerifyErrorKind::SmtpTimeout
                | VerifyErrorKind::SmtpTransientReject
                | VerifyErrorKind::Greylisted
                | VerifyErrorKind::PoolExhausted
                | VerifyErrorKind::TlsHandshake
                | VerifyErrorKind::DnsLookup
        )
    }

    /// Returns true if the failure settles the outcome for this address.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerifyErrorKind::Format
                | VerifyErrorKind::LengthExceeded
                | VerifyErrorKind::DisposableDomain
                | VerifyErrorKind::TypoDomain
                | VerifyErrorKind::SpamKeywords
                | VerifyErrorKind::PlusAddressing
                | VerifyErrorKind::NoMxRecord
                | VerifyErrorKind::SmtpPermanentReject
        )
    }

    /// Returns the severity level of this error kind.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            VerifyErrorKind::Configuration => ErrorSeverity::Critical,

            VerifyErrorKind::NotConnected
            | VerifyErrorKind::Protocol
            | VerifyErrorKind::TlsUnavailable
            | VerifyErrorKind::TlsHandshake
            | VerifyErrorKind::UnknownClassification => ErrorSeverity::Error,

            VerifyErrorKind::SmtpConnect
            | VerifyErrorKind::SmtpTimeout
            | VerifyErrorKind::SmtpTransientReject
            | VerifyErrorKind::Greylisted
            | VerifyErrorKind::PoolExhausted
            | VerifyErrorKind::DnsLookup => ErrorSeverity::Warning,

            VerifyErrorKind::Format
            | VerifyErrorKind::LengthExceeded
            | VerifyErrorKind::DisposableDomain
            | VerifyErrorKind::TypoDomain
            | VerifyErrorKind::SpamKeywords
            | VerifyErrorKind::PlusAddressing
            | VerifyErrorKind::NoMxRecord
            | VerifyErrorKind::SmtpPermanentReject => ErrorSeverity::Info,
        }
    }
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyErrorKind::Format => write!(f, "Invalid email format"),
            VerifyErrorKind::LengthExceeded => write!(f, "Email too long"),
            VerifyErrorKind::DisposableDomain => write!(f, "Disposable domain"),
            VerifyErrorKind::TypoDomain => write!(f, "Possible domain typo"),
            VerifyErrorKind::SpamKeywords => write!(f, "Spam keywords"),
            VerifyErrorKind::PlusAddressing => write!(f, "Plus addressing not supported"),
            VerifyErrorKind::NoMxRecord => write!(f, "No MX records"),
            VerifyErrorKind::DnsLookup => write!(f, "DNS lookup failed"),
            VerifyErrorKind::SmtpConnect => write!(f, "SMTP connect failed"),
            VerifyErrorKind::SmtpTimeout => write!(f, "SMTP timeout"),
            VerifyErrorKind::SmtpPermanentReject => write!(f, "Mailbox rejected"),
            VerifyErrorKind::SmtpTransientReject => write!(f, "Temporary rejection"),
            VerifyErrorKind::Greylisted => write!(f, "Greylisted"),
            VerifyErrorKind::UnknownClassification => write!(f, "Unclassified reply"),
            VerifyErrorKind::NotConnected => write!(f, "Not connected"),
            VerifyErrorKind::TlsUnavailable => write!(f, "STARTTLS unavailable"),
            VerifyErrorKind::TlsHandshake => write!(f, "TLS handshake failed"),
            VerifyErrorKind::Protocol => write!(f, "Protocol error"),
            VerifyErrorKind::PoolExhausted => write!(f, "Connection pool exhausted"),
            VerifyErrorKind::Configuration => write!(f, "Invalid configuration"),
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected outcome for bad input.
    Info,
    /// Temporary issue, may recover.
    Warning,
    /// Operation failed.
    Error,
    /// Requires operator attention.
    Critical,
}

/// Enhanced mail system status code (RFC 3463).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (1=addressing, 2=mailbox, 7=security/policy, ...).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses an enhanced status code such as `5.1.1`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class: u8 = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Finds the first enhanced status code anywhere in a reply text.
    pub fn find_in(text: &str) -> Option<Self> {
        text.split_whitespace()
            .map(|token| token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.'))
            .find_map(Self::parse)
    }

    /// Returns true if this is a success status.
    pub fn is_success(&self) -> bool {
        self.class == 2
    }

    /// Returns true if this is a temporary failure.
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Verification error with detailed information.
#[derive(Error, Debug)]
pub struct VerifyError {
    kind: VerifyErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    suggestion: Option<String>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl VerifyError {
    /// Creates a new error.
    pub fn new(kind: VerifyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            suggestion: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the suggested correction (typo domains).
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> VerifyErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns the suggested correction if available.
    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return (400..500).contains(&code);
        }
        self.kind.is_retryable()
    }

    /// Returns true if this error settles the outcome for the address.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Returns the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    // Convenience constructors

    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::Format, message)
    }

    /// Creates a connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::SmtpConnect, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::SmtpTimeout, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::Protocol, message)
    }

    /// Creates a TLS handshake error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::TlsHandshake, message)
    }

    /// Creates a "not connected" error.
    pub fn not_connected() -> Self {
        Self::new(VerifyErrorKind::NotConnected, "not connected")
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::Configuration, message)
    }

    /// Creates a "no MX records" error for a domain.
    pub fn no_mx(domain: &str) -> Self {
        Self::new(
            VerifyErrorKind::NoMxRecord,
            format!("No MX or A records found for domain {}", domain),
        )
    }

    /// Creates an error from an SMTP reply that did not complete a step.
    pub fn from_smtp_reply(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            400..=499 => VerifyErrorKind::SmtpTransientReject,
            500..=599 => VerifyErrorKind::SmtpPermanentReject,
            _ => VerifyErrorKind::UnknownClassification,
        };
        let message = message.into();
        let mut err = Self::new(kind, message.clone()).with_smtp_code(code);
        if let Some(enhanced) = EnhancedStatusCode::find_in(&message) {
            err = err.with_enhanced_code(enhanced);
        }
        err
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (did you mean {}?)", suggestion)?;
        }
        Ok(())
    }
}
