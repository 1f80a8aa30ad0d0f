//! Email validation pipeline and batch processing.
//!
//! `EmailValidationService` is the entry point of the crate. It runs the
//! pattern checks, resolves MX records, hands deliverable-looking addresses
//! to the SMTP verifier and folds everything into a scored
//! `ValidationResult`. Batches are de-duplicated and processed in groups of
//! `batch_size`; each group completes before the next one starts.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::ValidatorConfig;
use crate::dns::{DnsMxLookup, MxLookup, MxResolver};
use crate::errors::{VerifyErrorKind, VerifyResult};
use crate::observability::{ProbeMetrics, RequestContext, Timer};
use crate::patterns::{self, PatternReport};
use crate::pool::ConnectionPool;
use crate::rotation::RotationService;
use crate::types::{
    CacheStatistics, ValidationDetails, ValidationResult, ValidationStatistics, Verdict,
};
use crate::verifier::SmtpVerificationService;

const FORMAT_WEIGHT: i32 = 30;
const MX_WEIGHT: i32 = 30;
const SMTP_WEIGHT: i32 = 40;
const SMTP_UNKNOWN_WEIGHT: i32 = 20;

const SUSPICIOUS_PENALTY: i32 = 15;
const ROLE_PENALTY: i32 = 10;
const SPAM_KEYWORD_PENALTY: i32 = 5;
const TYPO_PENALTY: i32 = 20;
const CATCH_ALL_PENALTY: i32 = 10;

/// Validates email addresses.
#[derive(Debug)]
pub struct EmailValidationService {
    config: Arc<ValidatorConfig>,
    resolver: Arc<MxResolver>,
    rotation: Arc<RotationService>,
    pool: Arc<ConnectionPool>,
    verifier: SmtpVerificationService,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EmailValidationService {
    /// Creates a service that resolves MX records through system DNS.
    pub fn new(config: ValidatorConfig) -> VerifyResult<Self> {
        let lookup = Arc::new(DnsMxLookup::new(&config));
        Self::with_lookup(config, lookup)
    }

    /// Creates a service over a custom MX lookup.
    pub fn with_lookup(config: ValidatorConfig, lookup: Arc<dyn MxLookup>) -> VerifyResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let resolver = Arc::new(MxResolver::new(lookup, &config));
        let rotation = Arc::new(RotationService::from_config(&config));
        let pool = Arc::new(ConnectionPool::new(&config));
        let verifier = SmtpVerificationService::new(
            config.clone(),
            resolver.clone(),
            pool.clone(),
            rotation.clone(),
            Arc::new(ProbeMetrics::new()),
        );

        Ok(Self {
            config,
            resolver,
            rotation,
            pool,
            verifier,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Returns the SMTP verifier.
    pub fn verifier(&self) -> &SmtpVerificationService {
        &self.verifier
    }

    /// Returns the rotation service.
    pub fn rotation(&self) -> &RotationService {
        &self.rotation
    }

    /// Starts the background maintenance tasks.
    ///
    /// Sweeps idle pooled connections, purges expired MX cache entries and
    /// bounds the rotation usage table. Calling `start` twice has no effect.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            return;
        }

        let interval = self.config.pool_sweep_interval;
        if self.config.enable_connection_pooling {
            tasks.push(self.pool.spawn_sweeper(interval));
        }
        tasks.push(
            self.resolver
                .spawn_cache_sweeper(self.config.mx_cache_sweep_interval),
        );

        let rotation = Arc::downgrade(&self.rotation);
        let max_tracked = self.config.max_tracked_domains;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(rotation) = rotation.upgrade() else {
                    break;
                };
                rotation.cleanup_old_usage_stats(max_tracked);
            }
        }));

        info!(tasks = tasks.len(), "Validation service started");
    }

    /// Stops background tasks and closes every pooled connection.
    pub fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.pool.close();
        info!("Validation service stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates one address. Never fails; every problem ends up in the result.
    pub async fn validate_single(&self, email: &str) -> ValidationResult {
        let timer = Timer::start("validate_single");
        let email = email.trim();
        let mut result = ValidationResult {
            email: email.to_string(),
            valid: false,
            score: 0,
            reason: Vec::new(),
            details: ValidationDetails::default(),
            suggestion: None,
            processing_time_ms: 0,
            from_cache: false,
            smtp_attempted: false,
            smtp_result: None,
            catch_all: false,
            checked_at: Utc::now(),
        };

        let report = match patterns::check_email(email, &self.config) {
            Ok(report) => report,
            Err(e) => {
                let kind = e.kind();
                result.details.format =
                    !matches!(kind, VerifyErrorKind::Format | VerifyErrorKind::LengthExceeded);
                result.details.disposable = kind == VerifyErrorKind::DisposableDomain;
                result.details.typo = kind == VerifyErrorKind::TypoDomain;
                result.details.spam_keywords = kind == VerifyErrorKind::SpamKeywords;
                result.suggestion = e.suggestion().map(str::to_string);
                result.reason.push(match e.suggestion() {
                    Some(suggestion) => format!("{}, did you mean {}?", e.message(), suggestion),
                    None => e.message().to_string(),
                });
                debug!(email = %email, kind = %kind, "Address failed pattern checks");
                return Self::finish(result, timer);
            }
        };

        result.details.format = true;
        Self::apply_soft_signals(&mut result, &report);

        let records = match self.resolver.resolve(&report.domain).await {
            Ok(lookup) => {
                result.details.mx = true;
                result.from_cache = lookup.from_cache;
                lookup.records
            }
            Err(e) => {
                result.reason.push(e.message().to_string());
                result.score = score(&result);
                return Self::finish(result, timer);
            }
        };

        if self.config.enable_smtp_validation {
            let outcome = self
                .verifier
                .verify_mailbox(&report.normalized_email(), &report.domain, records, None)
                .await;
            result.smtp_attempted = true;
            result.smtp_result = Some(outcome.result);
            result.details.smtp = outcome.result == Verdict::Valid;
            result.catch_all = outcome.catch_all;
            if outcome.result != Verdict::Valid {
                result.reason.push(outcome.reason);
            }
            if outcome.catch_all {
                result.reason.push("Domain accepts any recipient".to_string());
            }
        } else {
            // Bypassed probes count as passed.
            result.details.smtp = true;
        }

        result.score = score(&result);
        result.valid = result.details.format
            && result.details.mx
            && result.smtp_result != Some(Verdict::Invalid)
            && result.score >= self.config.min_valid_score;
        if result.valid && result.reason.is_empty() {
            result.reason.push("Valid email address".to_string());
        } else if !result.valid && result.score < self.config.min_valid_score {
            result
                .reason
                .push(format!("Score {} below threshold {}", result.score, self.config.min_valid_score));
        }

        Self::finish(result, timer)
    }

    fn apply_soft_signals(result: &mut ValidationResult, report: &PatternReport) {
        result.details.role = report.role;
        result.details.suspicious = report.suspicious;
        result.details.spam_keywords = report.spam_keywords;
        result.details.typo = report.typo;
        result.suggestion = report.suggestion.clone();

        if let Some(suggestion) = &report.suggestion {
            result.reason.push(format!("Possible typo, did you mean {}?", suggestion));
        }
        if report.role {
            result.reason.push("Role-based account".to_string());
        }
        for pattern in &report.suspicious_reasons {
            result.reason.push(format!("Suspicious pattern: {}", pattern));
        }
        if report.spam_keywords {
            result.reason.push("Contains spam keywords".to_string());
        }
    }

    fn finish(mut result: ValidationResult, timer: Timer) -> ValidationResult {
        result.processing_time_ms = timer.elapsed_ms();
        result.checked_at = Utc::now();
        debug!(
            email = %result.email,
            valid = result.valid,
            score = result.score,
            elapsed_ms = result.processing_time_ms,
            "Validation finished"
        );
        result
    }

    /// Validates a list of addresses.
    ///
    /// Duplicates (case-insensitive) are validated once. A panic while
    /// validating one address turns into an invalid result for that address
    /// only.
    pub async fn validate_batch<S: AsRef<str>>(
        &self,
        emails: &[S],
        request_id: Option<&str>,
    ) -> Vec<ValidationResult> {
        let unique = Self::remove_duplicates(emails);
        let ctx = RequestContext::new(request_id, emails.len()).with_unique(unique.len());
        let span = info_span!("validate_batch", request_id = %ctx.request_id);

        async move {
            let timer = Timer::start("validate_batch");
            let batch_size = self.config.batch_size.max(1);
            info!(
                submitted = ctx.submitted,
                unique = ctx.unique,
                batch_size,
                "Batch validation started"
            );

            let mut results = Vec::with_capacity(unique.len());
            for group in unique.chunks(batch_size) {
                let validations = group.iter().map(|email| async move {
                    match AssertUnwindSafe(self.validate_single(email)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            error!(email = %email, "Validation panicked");
                            Self::failed(email, "Internal error during validation")
                        }
                    }
                });
                results.extend(join_all(validations).await);
            }

            let valid = results.iter().filter(|r| r.valid).count();
            info!(
                total = results.len(),
                valid,
                elapsed_ms = timer.elapsed_ms(),
                "Batch validation finished"
            );
            results
        }
        .instrument(span)
        .await
    }

    fn failed(email: &str, reason: &str) -> ValidationResult {
        ValidationResult {
            email: email.to_string(),
            valid: false,
            score: 0,
            reason: vec![reason.to_string()],
            details: ValidationDetails::default(),
            suggestion: None,
            processing_time_ms: 0,
            from_cache: false,
            smtp_attempted: false,
            smtp_result: Some(Verdict::Unknown),
            catch_all: false,
            checked_at: Utc::now(),
        }
    }

    /// Trims, lowercases and de-duplicates addresses, keeping first-seen order.
    /// Blank entries are dropped.
    pub fn remove_duplicates<S: AsRef<str>>(emails: &[S]) -> Vec<String> {
        let mut seen = HashSet::new();
        emails
            .iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .filter(|e| seen.insert(e.clone()))
            .collect()
    }

    /// Aggregates a set of results.
    pub fn calculate_statistics(results: &[ValidationResult]) -> ValidationStatistics {
        let total = results.len();
        if total == 0 {
            return ValidationStatistics::default();
        }

        let valid = results.iter().filter(|r| r.valid).count();
        let unknown = results
            .iter()
            .filter(|r| r.smtp_result == Some(Verdict::Unknown))
            .count();
        let score_sum: u64 = results.iter().map(|r| u64::from(r.score)).sum();
        let percent = |n: usize| round2(n as f64 * 100.0 / total as f64);

        ValidationStatistics {
            total,
            valid,
            invalid: total - valid,
            unknown,
            valid_percentage: percent(valid),
            invalid_percentage: percent(total - valid),
            average_score: round2(score_sum as f64 / total as f64),
        }
    }

    /// Cache, pool and probe statistics.
    pub fn get_cache_statistics(&self) -> CacheStatistics {
        CacheStatistics {
            mx_cache: self.resolver.cache().stats(),
            pool: self.pool.get_stats(),
            rotation_tracked_domains: self.rotation.tracked_domains(),
            probes: self.verifier.metrics(),
        }
    }

    /// Domains currently held in the MX cache.
    pub fn get_cached_domains(&self) -> Vec<String> {
        self.resolver.cache().domains()
    }

    /// Drops every MX cache entry.
    pub fn clear_mx_cache(&self) {
        self.resolver.cache().clear();
        info!("MX cache cleared");
    }
}

impl Drop for EmailValidationService {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

/// Combines the check flags into a 0..=100 score.
fn score(result: &ValidationResult) -> u8 {
    let details = &result.details;
    let mut score = 0;

    if details.format {
        score += FORMAT_WEIGHT;
    }
    if details.mx {
        score += MX_WEIGHT;
        score += match result.smtp_result {
            Some(Verdict::Valid) => SMTP_WEIGHT,
            Some(Verdict::Unknown) => SMTP_UNKNOWN_WEIGHT,
            Some(Verdict::Invalid) => 0,
            None if details.smtp => SMTP_WEIGHT,
            None => 0,
        };
    }

    if details.suspicious {
        score -= SUSPICIOUS_PENALTY;
    }
    if details.role {
        score -= ROLE_PENALTY;
    }
    if details.spam_keywords {
        score -= SPAM_KEYWORD_PENALTY;
    }
    if details.typo {
        score -= TYPO_PENALTY;
    }
    if result.catch_all {
        score -= CATCH_ALL_PENALTY;
    }

    u8::try_from(score.clamp(0, 100)).unwrap_or(0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
