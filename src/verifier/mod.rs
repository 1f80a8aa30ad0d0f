//! Mailbox probing across the exchangers of a domain.
//!
//! `SmtpVerificationService` ties the pieces together: it resolves MX
//! records, walks the exchangers in priority order, borrows a connection
//! from the pool, presents a rotated sender identity and classifies the
//! answer to `RCPT TO`. A host that cannot be reached only moves the probe
//! to the next exchanger; the address is reported invalid solely on an
//! explicit mailbox-level 5xx. A 5xx that blames the sender's reputation
//! (`is_policy_block`) is reported as `unknown`/`blocked`.
//!
//! A pooled connection greeted under another HELO domain is greeted again,
//! so every probe presents the identity it was given.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::analyzer::{classify, is_policy_block};
use crate::config::{StartTlsMode, ValidatorConfig, VerifyOptions};
use crate::dns::MxResolver;
use crate::errors::{VerifyError, VerifyErrorKind, VerifyResult};
use crate::observability::{MetricsSnapshot, ProbeMetrics};
use crate::patterns;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::rotation::RotationService;
use crate::types::{
    MxRecord, ReasonCode, SmtpClassification, SmtpDetails, SmtpVerification, Verdict,
};

/// Per-call settings after applying `VerifyOptions` over the configuration.
#[derive(Debug, Clone)]
struct ProbeSettings {
    helo_domain: Option<String>,
    from_address: Option<String>,
    max_retries: u32,
    verbose: bool,
    starttls: StartTlsMode,
    detect_catch_all: bool,
}

impl ProbeSettings {
    fn resolve(config: &ValidatorConfig, options: Option<&VerifyOptions>) -> Self {
        let options = options.cloned().unwrap_or_default();
        Self {
            helo_domain: options.helo_domain,
            from_address: options.from_address,
            max_retries: options.max_retries.unwrap_or(config.max_retries),
            verbose: options.verbose.unwrap_or(config.verbose),
            starttls: options.starttls.unwrap_or(config.starttls),
            detect_catch_all: options.detect_catch_all.unwrap_or(config.detect_catch_all),
        }
    }
}

/// Final answer of one exchanger.
#[derive(Debug)]
struct HostVerdict {
    classification: SmtpClassification,
    catch_all: bool,
}

/// Probes mailboxes over SMTP.
#[derive(Debug)]
pub struct SmtpVerificationService {
    config: Arc<ValidatorConfig>,
    resolver: Arc<MxResolver>,
    pool: Arc<ConnectionPool>,
    rotation: Arc<RotationService>,
    metrics: Arc<ProbeMetrics>,
}

impl SmtpVerificationService {
    /// Creates a service over shared components.
    pub fn new(
        config: Arc<ValidatorConfig>,
        resolver: Arc<MxResolver>,
        pool: Arc<ConnectionPool>,
        rotation: Arc<RotationService>,
        metrics: Arc<ProbeMetrics>,
    ) -> Self {
        Self {
            config,
            resolver,
            pool,
            rotation,
            metrics,
        }
    }

    /// Probe counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Connection pool used for probing.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Checks the format, resolves MX records and probes the mailbox.
    pub async fn verify_email(&self, email: &str, options: Option<&VerifyOptions>) -> SmtpVerification {
        let report = match patterns::check_email(email, &self.config) {
            Ok(report) => report,
            Err(e) => return Self::rejected(Verdict::Invalid, &e),
        };

        let records = match self.resolver.resolve(&report.domain).await {
            Ok(lookup) => lookup.records,
            Err(e) if e.kind() == VerifyErrorKind::NoMxRecord => {
                return Self::rejected(Verdict::Invalid, &e)
            }
            Err(e) => return Self::rejected(Verdict::Unknown, &e),
        };

        self.verify_mailbox(&report.normalized_email(), &report.domain, records, options)
            .await
    }

    /// Probes a mailbox against already resolved exchangers.
    ///
    /// At most `1 + max_retries` exchangers are contacted. Only failures to
    /// reach or talk to a host move on to the next one; any reply to
    /// `MAIL FROM` or `RCPT TO` is final.
    pub async fn verify_mailbox(
        &self,
        email: &str,
        domain: &str,
        records: Vec<MxRecord>,
        options: Option<&VerifyOptions>,
    ) -> SmtpVerification {
        let settings = ProbeSettings::resolve(&self.config, options);
        let attempts = usize::try_from(settings.max_retries)
            .unwrap_or(usize::MAX)
            .saturating_add(1);

        self.metrics.record_probe();
        let mut details = SmtpDetails::default();
        let mut last_error: Option<VerifyError> = None;
        let mut last_reply: Option<SmtpClassification> = None;

        let candidates: Vec<MxRecord> = records.iter().take(attempts).cloned().collect();
        for (index, mx) in candidates.iter().enumerate() {
            if index > 0 {
                self.metrics.record_host_fallback();
            }
            details.hosts_tried.push(mx.address());

            match self.probe_host(mx, email, domain, &settings, &mut details).await {
                Ok(verdict) => {
                    details.mx_host = Some(mx.address());
                    return self.conclude(verdict, records, details);
                }
                Err(e) => {
                    warn!(mx = %mx.address(), email = %email, error = %e, "Exchanger probe failed");
                    if let Some(code) = e.smtp_code() {
                        last_reply = Some(downgrade(classify(code, e.message(), e.message())));
                    }
                    last_error = Some(e);
                }
            }
        }

        let classification = last_reply.unwrap_or_else(|| match &last_error {
            Some(e) if e.kind() == VerifyErrorKind::SmtpTimeout => {
                SmtpClassification::unreachable(ReasonCode::Timeout, e.message())
            }
            Some(e) => SmtpClassification::unreachable(ReasonCode::ConnectionFailed, e.message()),
            None => SmtpClassification::unreachable(
                ReasonCode::ConnectionFailed,
                "No mail exchanger to contact",
            ),
        });
        self.conclude(
            HostVerdict {
                classification,
                catch_all: false,
            },
            records,
            details,
        )
    }

    fn rejected(result: Verdict, error: &VerifyError) -> SmtpVerification {
        SmtpVerification {
            valid: false,
            result,
            reason: error.to_string(),
            mx_records: None,
            smtp_details: None,
            catch_all: false,
        }
    }

    fn conclude(
        &self,
        verdict: HostVerdict,
        records: Vec<MxRecord>,
        mut details: SmtpDetails,
    ) -> SmtpVerification {
        let classification = verdict.classification;
        let result = classification.result;
        self.metrics.record_verdict(result);
        if classification.reason_code == ReasonCode::Greylisted {
            self.metrics.record_greylisted();
        }

        let reason = describe(&classification, details.mx_host.as_deref());
        info!(
            result = %result,
            reason_code = %classification.reason_code,
            smtp_code = classification.smtp_code,
            mx = details.mx_host.as_deref().unwrap_or("-"),
            "Mailbox probe finished"
        );

        details.classification = Some(classification);
        SmtpVerification {
            valid: result == Verdict::Valid,
            result,
            reason,
            mx_records: Some(records),
            smtp_details: Some(details),
            catch_all: verdict.catch_all,
        }
    }

    async fn probe_host(
        &self,
        mx: &MxRecord,
        email: &str,
        domain: &str,
        settings: &ProbeSettings,
        details: &mut SmtpDetails,
    ) -> VerifyResult<HostVerdict> {
        let mut conn = match self.pool.acquire(mx).await {
            Ok(conn) => {
                self.metrics.record_connection_attempt(true);
                conn
            }
            Err(e) => {
                self.metrics.record_connection_attempt(false);
                return Err(e);
            }
        };
        if conn.is_reused() {
            self.metrics.record_pool_reuse();
        }
        details.reused_connection = conn.is_reused();
        if settings.verbose {
            conn.start_transcript();
        }

        let outcome = self.exchange(&mut conn, email, domain, settings, details).await;

        if settings.verbose {
            details.transcript.extend(conn.take_transcript());
        }
        if let Err(e) = &outcome {
            debug!(mx = %mx.address(), error = %e, "Discarding connection after failed exchange");
            conn.mark_broken();
        }
        self.pool.release(conn).await;
        outcome
    }

    async fn exchange(
        &self,
        conn: &mut PooledConnection,
        email: &str,
        domain: &str,
        settings: &ProbeSettings,
        details: &mut SmtpDetails,
    ) -> VerifyResult<HostVerdict> {
        let (helo, from) = self.sender_identity(domain, settings);

        if !conn.is_greeted() || conn.helo_domain() != Some(helo.as_str()) {
            if conn.is_greeted() {
                debug!(previous = ?conn.helo_domain(), helo = %helo, "Greeting pooled connection again");
            }
            conn.greet(&helo).await?;
        }
        details.helo_domain = conn.helo_domain().map(str::to_string);

        if !conn.is_tls()
            && conn
                .starttls(settings.starttls, self.config.accept_invalid_certs)
                .await?
        {
            self.metrics.record_tls_upgrade();
        }
        details.tls = conn.is_tls();

        details.from_address = Some(from.clone());
        let mail = conn.mail_from(&from).await?;
        if !mail.is_success() {
            // The sender was refused; nothing is known about the mailbox.
            let classification = downgrade(classify(mail.code, &mail.full_message(), mail.raw_line()));
            conn.mark_classified();
            return Ok(HostVerdict {
                classification,
                catch_all: false,
            });
        }

        let rcpt = conn.rcpt_to(email).await?;
        let classification = distrust_policy_block(classify(
            rcpt.code,
            &rcpt.full_message(),
            rcpt.raw_line(),
        ));
        debug!(
            email = %email,
            code = rcpt.code,
            result = %classification.result,
            "RCPT TO classified"
        );

        let catch_all = classification.result == Verdict::Valid
            && settings.detect_catch_all
            && self.accepts_anyone(conn, domain).await;

        conn.mark_classified();
        Ok(HostVerdict {
            classification,
            catch_all,
        })
    }

    /// HELO domain and FROM address for one exchange.
    ///
    /// Overridden parts are taken as given; only the rotated parts are
    /// drawn from (and recorded by) the rotation service.
    fn sender_identity(&self, domain: &str, settings: &ProbeSettings) -> (String, String) {
        match (&settings.helo_domain, &settings.from_address) {
            (Some(helo), Some(from)) => (helo.clone(), from.clone()),
            (Some(helo), None) => (helo.clone(), self.rotation.get_next_from_address(Some(domain))),
            (None, Some(from)) => (self.rotation.get_next_helo_domain(Some(domain)), from.clone()),
            (None, None) => {
                let rotated = self.rotation.get_rotated_credentials(Some(domain));
                (rotated.helo_domain, rotated.from_address)
            }
        }
    }

    /// Offers a random recipient in the same transaction.
    async fn accepts_anyone(&self, conn: &mut PooledConnection, domain: &str) -> bool {
        let local: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect::<String>()
            .to_ascii_lowercase();
        let probe = format!("mp{}@{}", local, domain);

        match conn.rcpt_to(&probe).await {
            Ok(reply) => {
                let accepted = reply.is_success();
                debug!(domain = %domain, accepted, "Catch-all probe answered");
                accepted
            }
            Err(e) => {
                debug!(domain = %domain, error = %e, "Catch-all probe failed");
                false
            }
        }
    }
}

/// Removes any claim about the mailbox from a reply that was not about it.
fn downgrade(classification: SmtpClassification) -> SmtpClassification {
    let mut classification = distrust_policy_block(classification);
    classification.result = Verdict::Unknown;
    classification
}

/// A reputation block rejects the sender, not the mailbox.
fn distrust_policy_block(mut classification: SmtpClassification) -> SmtpClassification {
    if is_policy_block(&classification) {
        classification.result = Verdict::Unknown;
        classification.reason_code = ReasonCode::Blocked;
    }
    classification
}

fn describe(classification: &SmtpClassification, mx: Option<&str>) -> String {
    let host = mx.unwrap_or("any exchanger");
    match classification.result {
        Verdict::Valid => format!("Mailbox accepted by {}", host),
        Verdict::Invalid => format!(
            "Mailbox rejected by {} ({}): {}",
            host, classification.reason_code, classification.detail
        ),
        Verdict::Unknown if classification.smtp_code == 0 => format!(
            "Could not verify mailbox ({}): {}",
            classification.reason_code, classification.detail
        ),
        Verdict::Unknown => format!(
            "Inconclusive reply from {} ({}): {}",
            host, classification.reason_code, classification.detail
        ),
    }
}
