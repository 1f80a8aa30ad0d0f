//! MX resolution with a TTL cache.
//!
//! Lookups go through the `MxLookup` trait so the resolver can be swapped
//! for a scripted one in tests. `MxResolver` consults `MxCache` first and
//! caches both outcomes: successful lookups for `mx_cache_ttl`, failures for
//! the shorter `mx_failure_ttl`. Expiry is checked on read; a sweep task
//! started with `MxResolver::spawn_cache_sweeper` also drops entries that
//! are never read again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::ValidatorConfig;
use crate::errors::{VerifyError, VerifyErrorKind, VerifyResult};
use crate::types::{MxCacheStats, MxLookupResult, MxRecord};

/// Source of MX records for a domain.
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// Looks up the mail exchangers of a domain.
    ///
    /// Fails with `NoMxRecord` when neither MX nor address records exist and
    /// with `DnsLookup` for any other resolution failure.
    async fn lookup_mx(&self, domain: &str) -> VerifyResult<Vec<MxRecord>>;
}

/// MX lookup backed by the system DNS configuration.
pub struct DnsMxLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
    port: u16,
}

impl std::fmt::Debug for DnsMxLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsMxLookup")
            .field("timeout", &self.timeout)
            .field("port", &self.port)
            .finish()
    }
}

impl DnsMxLookup {
    /// Creates a lookup using `/etc/resolv.conf`, falling back to the
    /// default upstream servers if it cannot be read.
    pub fn new(config: &ValidatorConfig) -> Self {
        let (resolver_config, mut opts) = trust_dns_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Cannot read system DNS configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            });
        opts.timeout = config.dns_timeout;
        Self::with_resolver_config(resolver_config, opts, config)
    }

    /// Creates a lookup with an explicit resolver configuration.
    pub fn with_resolver_config(
        resolver_config: ResolverConfig,
        opts: ResolverOpts,
        config: &ValidatorConfig,
    ) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
            timeout: config.dns_timeout,
            port: config.smtp_port,
        }
    }

    async fn resolve(&self, domain: &str) -> VerifyResult<Vec<MxRecord>> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let records: Vec<MxRecord> = lookup
                    .iter()
                    .filter_map(|mx| {
                        let host = mx.exchange().to_utf8();
                        let host = host.trim_end_matches('.');
                        // A "." exchange is a null MX (RFC 7505)
                        (!host.is_empty()).then(|| MxRecord::new(host, mx.preference(), self.port))
                    })
                    .collect();

                if records.is_empty() {
                    return Err(VerifyError::no_mx(domain));
                }
                Ok(records)
            }
            Err(err) if is_no_records(&err) => {
                debug!(domain = %domain, "No MX records, trying address records");
                self.fallback_to_address(domain).await
            }
            Err(err) => Err(lookup_failed(domain, err)),
        }
    }

    /// Implicit MX: the domain itself at priority 0 (RFC 5321 section 5.1).
    async fn fallback_to_address(&self, domain: &str) -> VerifyResult<Vec<MxRecord>> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) if lookup.iter().next().is_some() => {
                Ok(vec![MxRecord::new(domain, 0, self.port)])
            }
            Ok(_) => Err(VerifyError::no_mx(domain)),
            Err(err) if is_no_records(&err) => Err(VerifyError::no_mx(domain)),
            Err(err) => Err(lookup_failed(domain, err)),
        }
    }
}

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn lookup_failed(domain: &str, err: ResolveError) -> VerifyError {
    warn!(domain = %domain, error = %err, "DNS lookup failed");
    VerifyError::new(
        VerifyErrorKind::DnsLookup,
        format!("DNS lookup failed for {}: {}", domain, err),
    )
    .with_cause(err)
}

#[async_trait]
impl MxLookup for DnsMxLookup {
    async fn lookup_mx(&self, domain: &str) -> VerifyResult<Vec<MxRecord>> {
        timeout(self.timeout, self.resolve(domain))
            .await
            .map_err(|_| {
                VerifyError::new(
                    VerifyErrorKind::DnsLookup,
                    format!("DNS lookup for {} timed out", domain),
                )
            })?
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    records: Vec<MxRecord>,
    expires_at: Instant,
    failure: Option<(VerifyErrorKind, String)>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Outcome served from the cache.
pub type CachedLookup = Result<Vec<MxRecord>, VerifyError>;

/// MX cache with separate lifetimes for successful and failed lookups.
#[derive(Debug)]
pub struct MxCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    success_ttl: Duration,
    failure_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MxCache {
    /// Creates an empty cache.
    pub fn new(success_ttl: Duration, failure_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            success_ttl,
            failure_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached outcome for a domain, if one is still live.
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&self, domain: &str) -> Option<CachedLookup> {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(domain) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(match &entry.failure {
                        Some((kind, message)) => Err(VerifyError::new(*kind, message.clone())),
                        None => Ok(entry.records.clone()),
                    });
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.get(domain).map_or(false, |e| e.is_expired(now)) {
                entries.remove(domain);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Caches a successful lookup.
    pub fn insert_success(&self, domain: &str, records: Vec<MxRecord>) {
        self.insert(domain, CacheEntry {
            records,
            expires_at: Instant::now() + self.success_ttl,
            failure: None,
        });
    }

    /// Caches a failed lookup.
    pub fn insert_failure(&self, domain: &str, error: &VerifyError) {
        self.insert(domain, CacheEntry {
            records: Vec::new(),
            expires_at: Instant::now() + self.failure_ttl,
            failure: Some((error.kind(), error.message().to_string())),
        });
    }

    fn insert(&self, domain: &str, entry: CacheEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.to_string(), entry);
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn size(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// hits / (hits + misses), or 0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Removes every entry and resets the counters.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Domains that currently have a live entry, sorted.
    pub fn domains(&self) -> Vec<String> {
        let now = Instant::now();
        let mut domains: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(domain, _)| domain.clone())
            .collect();
        domains.sort();
        domains
    }

    /// Drops every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> MxCacheStats {
        MxCacheStats {
            size: self.size(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Cache-fronted MX resolver.
pub struct MxResolver {
    lookup: Arc<dyn MxLookup>,
    cache: MxCache,
}

impl std::fmt::Debug for MxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxResolver").field("cache", &self.cache).finish()
    }
}

impl MxResolver {
    /// Creates a resolver over the given lookup.
    pub fn new(lookup: Arc<dyn MxLookup>, config: &ValidatorConfig) -> Self {
        Self {
            lookup,
            cache: MxCache::new(config.mx_cache_ttl, config.mx_failure_ttl),
        }
    }

    /// Resolves the mail exchangers of a domain, most preferred first.
    pub async fn resolve(&self, domain: &str) -> VerifyResult<MxLookupResult> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&domain) {
            debug!(domain = %domain, "MX cache hit");
            return cached.map(|records| MxLookupResult {
                records,
                from_cache: true,
            });
        }

        match self.lookup.lookup_mx(&domain).await {
            Ok(mut records) => {
                records.sort_by_key(|r| r.priority);
                debug!(domain = %domain, count = records.len(), "Resolved MX records");
                self.cache.insert_success(&domain, records.clone());
                Ok(MxLookupResult {
                    records,
                    from_cache: false,
                })
            }
            Err(err) => {
                debug!(domain = %domain, error = %err, "MX resolution failed");
                self.cache.insert_failure(&domain, &err);
                Err(err)
            }
        }
    }

    /// Returns the cache.
    pub fn cache(&self) -> &MxCache {
        &self.cache
    }

    /// Runs `MxCache::purge_expired` every `interval` until the resolver is dropped.
    pub fn spawn_cache_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let resolver: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                let removed = resolver.cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged expired MX cache entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockMxLookup;

    fn config(success: Duration, failure: Duration) -> ValidatorConfig {
        ValidatorConfig::builder()
            .mx_cache_ttls(success, failure)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_sorts_by_priority() {
        let lookup = Arc::new(MockMxLookup::new().with_records(
            "example.org",
            vec![
                MxRecord::new("mx2.example.org", 20, 25),
                MxRecord::new("mx1.example.org", 10, 25),
            ],
        ));
        let resolver = MxResolver::new(lookup, &ValidatorConfig::default());

        let result = resolver.resolve("Example.ORG").await.unwrap();
        assert!(!result.from_cache);
        assert_eq!(result.records[0].exchange, "mx1.example.org");
        assert_eq!(result.records[1].exchange, "mx2.example.org");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_lookup() {
        let lookup = Arc::new(
            MockMxLookup::new().with_records("example.org", vec![MxRecord::new("mx.example.org", 5, 25)]),
        );
        let resolver = MxResolver::new(lookup.clone(), &ValidatorConfig::default());

        resolver.resolve("example.org").await.unwrap();
        let second = resolver.resolve("example.org").await.unwrap();

        assert!(second.from_cache);
        assert_eq!(lookup.lookup_count("example.org"), 1);
        assert_eq!(resolver.cache().stats().hits, 1);
        assert_eq!(resolver.cache().stats().misses, 1);
        assert_eq!(resolver.cache().hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_new_lookup() {
        let lookup = Arc::new(
            MockMxLookup::new().with_records("example.org", vec![MxRecord::new("mx.example.org", 5, 25)]),
        );
        let resolver = MxResolver::new(
            lookup.clone(),
            &config(Duration::from_millis(20), Duration::from_millis(10)),
        );

        resolver.resolve("example.org").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = resolver.resolve("example.org").await.unwrap();

        assert!(!again.from_cache);
        assert_eq!(lookup.lookup_count("example.org"), 2);
    }

    #[tokio::test]
    async fn test_failures_are_cached() {
        let lookup = Arc::new(MockMxLookup::new());
        let resolver = MxResolver::new(lookup.clone(), &ValidatorConfig::default());

        let err = resolver.resolve("nowhere.invalid").await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::NoMxRecord);

        let err = resolver.resolve("nowhere.invalid").await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::NoMxRecord);
        assert_eq!(lookup.lookup_count("nowhere.invalid"), 1);
    }

    #[test]
    fn test_cache_purge_and_clear() {
        let cache = MxCache::new(Duration::from_secs(60), Duration::ZERO);
        cache.insert_success("live.org", vec![MxRecord::new("mx.live.org", 0, 25)]);
        cache.insert_failure("dead.org", &VerifyError::no_mx("dead.org"));

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.domains(), vec!["live.org".to_string()]);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.size(), 1);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_cache_sweeper_drops_unread_entries() {
        let lookup = Arc::new(
            MockMxLookup::new().with_records("example.org", vec![MxRecord::new("mx.example.org", 5, 25)]),
        );
        let resolver = Arc::new(MxResolver::new(
            lookup,
            &config(Duration::from_millis(20), Duration::from_millis(10)),
        ));
        resolver.resolve("example.org").await.unwrap();
        let _ = resolver.resolve("missing.org").await;
        assert_eq!(resolver.cache().size(), 2);

        let sweeper = resolver.spawn_cache_sweeper(Duration::from_millis(15));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(resolver.cache().size(), 0);
        sweeper.abort();
    }
}
