//! # mailprobe
//!
//! Email deliverability verification that goes past syntax checks:
//! - Format and heuristic checks (length, punycode, disposable, typo,
//!   placeholder, spam-keyword, role and plus-addressing rules)
//! - MX resolution with a success/failure TTL cache
//! - Live SMTP mailbox probing that stops before `DATA`, with
//!   opportunistic STARTTLS and MX fallback
//! - Three-way reply classification (valid / invalid / unknown)
//! - Per-exchanger connection pooling and sender identity rotation
//! - Bounded-concurrency batch validation with per-item isolation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mailprobe::{EmailValidationService, ValidatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ValidatorConfig::builder()
//!         .helo_domains(["mx-check.example.org"])
//!         .from_addresses(["verify@mx-check.example.org"])
//!         .build()?;
//!
//!     let service = EmailValidationService::new(config)?;
//!     service.start();
//!
//!     let result = service.validate_single("someone@example.net").await;
//!     println!("valid={} score={} reasons={:?}", result.valid, result.score, result.reason);
//!
//!     let results = service
//!         .validate_batch(&["a@example.net", "A@example.net", "b@example.org"], None)
//!         .await;
//!     println!("{:?}", EmailValidationService::calculate_statistics(&results));
//!
//!     service.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Pure checks
pub mod analyzer;
pub mod patterns;

// DNS
pub mod dns;

// Sender identity
pub mod rotation;

// Protocol and transport
pub mod protocol;
pub mod transport;

// Connection pooling
pub mod pool;

// Orchestration
pub mod validator;
pub mod verifier;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use analyzer::{analyze_message, classify, is_policy_block};
pub use config::{
    PlusAddressingPolicy, StartTlsMode, ValidatorConfig, ValidatorConfigBuilder, VerifyOptions,
};
pub use dns::{DnsMxLookup, MxCache, MxLookup, MxResolver};
pub use errors::{ErrorSeverity, VerifyError, VerifyErrorKind, VerifyResult};
pub use observability::{MetricsSnapshot, ProbeMetrics};
pub use patterns::{check_email, PatternReport};
pub use pool::{ConnectionPool, PooledConnection};
pub use protocol::{EsmtpCapabilities, ProbeState, SmtpCommand, SmtpResponse};
pub use rotation::{RotatedCredentials, RotationService};
pub use transport::SmtpConnection;
pub use types::{
    CacheStatistics, MxRecord, PoolStats, ReasonCode, SmtpClassification, SmtpDetails,
    SmtpVerification, ValidationDetails, ValidationResult, ValidationStatistics, Verdict,
};
pub use validator::EmailValidationService;
pub use verifier::SmtpVerificationService;
