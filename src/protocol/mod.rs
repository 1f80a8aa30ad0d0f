//! SMTP protocol primitives for mailbox probing.
//!
//! Commands, reply parsing, EHLO capabilities and the probe state machine.
//! Only the subset of RFC 5321 a probe needs is modelled: the exchange
//! always stops before `DATA`.

use std::fmt;

use crate::errors::{EnhancedStatusCode, VerifyError, VerifyResult};

/// Commands issued during a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO, used when EHLO is refused.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// MAIL FROM command.
    MailFrom {
        /// Sender address (without angle brackets).
        address: String,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address (without angle brackets).
        address: String,
    },
    /// Reset transaction.
    Rset,
    /// No operation (keepalive).
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::MailFrom { address } => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_smtp_string())
    }
}

/// SMTP reply from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code leading the first line, if any.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line, without the code.
    pub message: Vec<String>,
    /// Lines as received.
    pub raw: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code,
            enhanced_code: None,
            raw: vec![format!("{} {}", code, message)],
            message: vec![message],
        }
    }

    /// Parses a response from raw lines.
    pub fn parse(lines: &[String]) -> VerifyResult<Self> {
        if lines.is_empty() {
            return Err(VerifyError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .filter(|c| (100..600).contains(c))
                .ok_or_else(|| VerifyError::protocol(format!("Invalid status line: {:?}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(VerifyError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            let text = if i == 0 {
                match Self::split_enhanced_code(text) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest
                    }
                    None => text,
                }
            } else {
                text
            };
            messages.push(text.trim().to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            raw: lines.to_vec(),
        })
    }

    fn split_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (first, rest) = text.split_once(' ').unwrap_or((text, ""));
        EnhancedStatusCode::parse(first).map(|esc| (esc, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a temporary failure (4xx).
    pub fn is_temporary_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Returns true if this is a permanent failure (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined, with the enhanced code restored.
    pub fn full_message(&self) -> String {
        let text = self.message.join(" ");
        match &self.enhanced_code {
            Some(esc) => format!("{} {}", esc, text).trim_end().to_string(),
            None => text,
        }
    }

    /// Returns the last raw line.
    pub fn raw_line(&self) -> &str {
        self.raw.last().map(|s| s.as_str()).unwrap_or("")
    }

    /// Converts a failed reply into an error.
    pub fn to_error(&self) -> VerifyError {
        let mut err = VerifyError::from_smtp_reply(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.full_message())
    }
}

/// Capabilities advertised in an EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpCapabilities {
    /// STARTTLS supported.
    pub starttls: bool,
    /// PIPELINING supported.
    pub pipelining: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// SMTPUTF8 supported.
    pub smtputf8: bool,
    /// Maximum message size.
    pub size: Option<usize>,
    /// Raw capability lines, uppercased. The greeting line is skipped.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (keyword, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match keyword {
                "STARTTLS" => caps.starttls = true,
                "PIPELINING" => caps.pipelining = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                "SMTPUTF8" => caps.smtputf8 = true,
                "SIZE" => caps.size = params.parse().ok(),
                _ => {}
            }
            caps.raw.push(line.clone());
        }

        caps
    }

    /// Checks if a capability keyword was advertised.
    pub fn has_capability(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.raw
            .iter()
            .any(|c| c.split_whitespace().next() == Some(upper.as_str()))
    }
}

/// State of a probe connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeState {
    /// No socket.
    Disconnected,
    /// Banner received.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// STARTTLS completed; a new EHLO is required.
    TlsNegotiated,
    /// MAIL FROM accepted.
    MailFromSent,
    /// RCPT TO answered.
    RcptToSent,
    /// Final reply classified; the transaction can be reset for reuse.
    Classified,
    /// QUIT sent or socket dropped.
    Closed,
}

impl ProbeState {
    /// Returns true if a socket is open.
    pub fn is_open(&self) -> bool {
        !matches!(self, ProbeState::Disconnected | ProbeState::Closed)
    }

    /// Returns true if STARTTLS may be issued.
    pub fn can_starttls(&self) -> bool {
        matches!(self, ProbeState::Greeted)
    }

    /// Returns true if MAIL FROM may be issued.
    pub fn can_start_mail(&self) -> bool {
        matches!(self, ProbeState::Greeted | ProbeState::Classified)
    }

    /// Returns true if RCPT TO may be issued.
    pub fn can_add_recipient(&self) -> bool {
        matches!(self, ProbeState::MailFromSent | ProbeState::RcptToSent)
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeState::Disconnected => "disconnected",
            ProbeState::Connected => "connected",
            ProbeState::Greeted => "greeted",
            ProbeState::TlsNegotiated => "tls_negotiated",
            ProbeState::MailFromSent => "mail_from_sent",
            ProbeState::RcptToSent => "rcpt_to_sent",
            ProbeState::Classified => "classified",
            ProbeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Reply codes the probe acts on.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// OK.
    pub const OK: u16 = 250;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Command not recognized.
    pub const SYNTAX_ERROR: u16 = 500;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}
