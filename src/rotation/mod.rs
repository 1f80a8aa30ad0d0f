//! Sender identity rotation.
//!
//! Two round-robin cursors walk the configured HELO domain and MAIL FROM
//! pools. When a target domain is given, the pick is also recorded per
//! domain so operators can see how often each target saw which identity.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::debug;

use crate::config::ValidatorConfig;

/// Per-target-domain usage record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainUsage {
    /// Pool index of the last HELO domain presented.
    pub helo_index: usize,
    /// Pool index of the last FROM address presented.
    pub from_index: usize,
    /// HELO picks for this domain.
    pub helo_usage_count: u64,
    /// FROM picks for this domain.
    pub from_usage_count: u64,
    /// Last time the entry was touched.
    pub last_used: Instant,
    touched: u64,
}

impl DomainUsage {
    fn new(touched: u64) -> Self {
        Self {
            helo_index: 0,
            from_index: 0,
            helo_usage_count: 0,
            from_usage_count: 0,
            last_used: Instant::now(),
            touched,
        }
    }
}

/// HELO domain and FROM address to present on one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedCredentials {
    /// Domain for EHLO/HELO.
    pub helo_domain: String,
    /// Address for MAIL FROM.
    pub from_address: String,
}

#[derive(Debug, Default)]
struct RotationState {
    helo_cursor: usize,
    from_cursor: usize,
    /// Cursor over the FROM candidates of each HELO pool index.
    pair_cursors: HashMap<usize, usize>,
    usage: HashMap<String, DomainUsage>,
    clock: u64,
}

impl RotationState {
    fn touch(&mut self, target: &str) -> &mut DomainUsage {
        self.clock += 1;
        let clock = self.clock;
        let entry = self
            .usage
            .entry(target.to_ascii_lowercase())
            .or_insert_with(|| DomainUsage::new(clock));
        entry.touched = clock;
        entry.last_used = Instant::now();
        entry
    }
}

/// Round-robin rotation over sender identities.
#[derive(Debug)]
pub struct RotationService {
    helo_domains: Vec<String>,
    from_addresses: Vec<String>,
    state: Mutex<RotationState>,
}

impl RotationService {
    /// Creates a rotation service over the given pools.
    ///
    /// Blank entries are dropped; an empty pool falls back to `localhost`.
    pub fn new(helo_domains: Vec<String>, from_addresses: Vec<String>) -> Self {
        let clean = |pool: Vec<String>, fallback: &str| {
            let pool: Vec<String> = pool
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if pool.is_empty() {
                vec![fallback.to_string()]
            } else {
                pool
            }
        };

        Self {
            helo_domains: clean(helo_domains, "localhost"),
            from_addresses: clean(from_addresses, "verify@localhost"),
            state: Mutex::new(RotationState::default()),
        }
    }

    /// Creates a rotation service from the configured pools.
    pub fn from_config(config: &ValidatorConfig) -> Self {
        Self::new(config.helo_domains.clone(), config.from_addresses.clone())
    }

    fn lock(&self) -> MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the next HELO domain.
    pub fn get_next_helo_domain(&self, target_domain: Option<&str>) -> String {
        let mut state = self.lock();
        let index = state.helo_cursor % self.helo_domains.len();
        state.helo_cursor = index + 1;

        if let Some(target) = target_domain {
            let usage = state.touch(target);
            usage.helo_index = index;
            usage.helo_usage_count += 1;
        }
        self.helo_domains[index].clone()
    }

    /// Returns the next MAIL FROM address.
    pub fn get_next_from_address(&self, target_domain: Option<&str>) -> String {
        let mut state = self.lock();
        let index = state.from_cursor % self.from_addresses.len();
        state.from_cursor = index + 1;

        if let Some(target) = target_domain {
            let usage = state.touch(target);
            usage.from_index = index;
            usage.from_usage_count += 1;
        }
        self.from_addresses[index].clone()
    }

    /// Returns a HELO domain and FROM address pair.
    ///
    /// Avoids a pair whose registrable domains match. Each HELO domain
    /// walks its own round robin over the FROM addresses it may be paired
    /// with; if every FROM address shares its registrable domain, it walks
    /// the whole pool instead.
    pub fn get_rotated_credentials(&self, target_domain: Option<&str>) -> RotatedCredentials {
        let mut state = self.lock();

        let helo_index = state.helo_cursor % self.helo_domains.len();
        state.helo_cursor = helo_index + 1;
        let helo_domain = &self.helo_domains[helo_index];
        let helo_base = registrable_domain(helo_domain);

        let eligible: Vec<usize> = (0..self.from_addresses.len())
            .filter(|&i| {
                let from_domain = self.from_addresses[i].rsplit('@').next().unwrap_or_default();
                registrable_domain(from_domain) != helo_base
            })
            .collect();
        let candidates: Vec<usize> = if eligible.is_empty() {
            (0..self.from_addresses.len()).collect()
        } else {
            eligible
        };

        let cursor = state.pair_cursors.entry(helo_index).or_insert(0);
        let slot = *cursor % candidates.len();
        *cursor = slot + 1;
        let from_index = candidates[slot];
        state.from_cursor = from_index + 1;

        if let Some(target) = target_domain {
            let usage = state.touch(target);
            usage.helo_index = helo_index;
            usage.from_index = from_index;
            usage.helo_usage_count += 1;
            usage.from_usage_count += 1;
        }

        let credentials = RotatedCredentials {
            helo_domain: helo_domain.clone(),
            from_address: self.from_addresses[from_index].clone(),
        };
        debug!(
            target = target_domain.unwrap_or("-"),
            helo = %credentials.helo_domain,
            from = %credentials.from_address,
            "Rotated sender identity"
        );
        credentials
    }

    /// Zeroes both cursors and forgets every tracked domain.
    pub fn reset(&self) {
        *self.lock() = RotationState::default();
    }

    /// Keeps at most `max_entries` tracked domains, dropping the least
    /// recently touched. Returns the number removed.
    pub fn cleanup_old_usage_stats(&self, max_entries: usize) -> usize {
        let mut state = self.lock();
        let excess = state.usage.len().saturating_sub(max_entries);
        if excess == 0 {
            return 0;
        }

        let mut by_age: Vec<(u64, String)> = state
            .usage
            .iter()
            .map(|(domain, usage)| (usage.touched, domain.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, domain) in by_age.into_iter().take(excess) {
            state.usage.remove(&domain);
        }
        debug!(removed = excess, "Pruned rotation usage stats");
        excess
    }

    /// Returns the usage record of a target domain.
    pub fn usage_for(&self, target_domain: &str) -> Option<DomainUsage> {
        self.lock().usage.get(&target_domain.to_ascii_lowercase()).cloned()
    }

    /// Number of tracked target domains.
    pub fn tracked_domains(&self) -> usize {
        self.lock().usage.len()
    }
}

/// Last two labels of a host name, lowercased.
fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [tld, name, ..] => format!("{}.{}", name, tld),
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn service() -> RotationService {
        RotationService::new(
            vec!["mx.alpha.org".into(), "mx.beta.org".into(), "mx.gamma.org".into()],
            vec!["probe@alpha.org".into(), "probe@delta.org".into()],
        )
    }

    #[test]
    fn test_helo_round_robin() {
        let rotation = service();
        let picks: Vec<String> = (0..7).map(|_| rotation.get_next_helo_domain(None)).collect();

        for domain in ["mx.alpha.org", "mx.beta.org", "mx.gamma.org"] {
            let seen = picks.iter().filter(|p| *p == domain).count();
            assert!(seen >= 7 / 3, "{domain} seen {seen} times");
        }
        assert_eq!(picks[0], "mx.alpha.org");
        assert_eq!(picks[3], "mx.alpha.org");
    }

    #[test]
    fn test_from_round_robin() {
        let rotation = service();
        assert_eq!(rotation.get_next_from_address(None), "probe@alpha.org");
        assert_eq!(rotation.get_next_from_address(None), "probe@delta.org");
        assert_eq!(rotation.get_next_from_address(None), "probe@alpha.org");
    }

    #[test]
    fn test_credentials_avoid_shared_domain() {
        let rotation = service();
        let creds = rotation.get_rotated_credentials(Some("example.com"));
        assert_eq!(creds.helo_domain, "mx.alpha.org");
        assert_eq!(creds.from_address, "probe@delta.org");

        let usage = rotation.usage_for("EXAMPLE.com").unwrap();
        assert_eq!(usage.helo_usage_count, 1);
        assert_eq!(usage.from_usage_count, 1);
        assert_eq!(usage.from_index, 1);
    }

    #[test]
    fn test_credentials_rotate_over_every_eligible_sender() {
        let rotation = RotationService::new(
            vec!["mx.alpha.org".into(), "mx.beta.org".into()],
            vec!["probe@alpha.org".into(), "probe@delta.org".into()],
        );
        let picks: Vec<RotatedCredentials> =
            (0..8).map(|_| rotation.get_rotated_credentials(None)).collect();

        let beta_senders: HashSet<&str> = picks
            .iter()
            .filter(|c| c.helo_domain == "mx.beta.org")
            .map(|c| c.from_address.as_str())
            .collect();
        assert_eq!(beta_senders.len(), 2);
        assert!(picks
            .iter()
            .filter(|c| c.helo_domain == "mx.alpha.org")
            .all(|c| c.from_address == "probe@delta.org"));
    }

    #[test]
    fn test_credentials_best_effort_when_unavoidable() {
        let rotation = RotationService::new(vec!["mail.solo.org".into()], vec!["a@solo.org".into()]);
        let creds = rotation.get_rotated_credentials(None);
        assert_eq!(creds.from_address, "a@solo.org");
    }

    #[test]
    fn test_reset_and_cleanup() {
        let rotation = service();
        rotation.get_next_helo_domain(Some("one.com"));
        rotation.get_next_helo_domain(Some("two.com"));
        rotation.get_next_helo_domain(Some("three.com"));
        rotation.get_next_from_address(Some("one.com"));

        assert_eq!(rotation.tracked_domains(), 3);
        assert_eq!(rotation.cleanup_old_usage_stats(2), 1);
        // two.com was touched least recently
        assert!(rotation.usage_for("two.com").is_none());
        assert!(rotation.usage_for("one.com").is_some());

        rotation.reset();
        assert_eq!(rotation.tracked_domains(), 0);
        assert_eq!(rotation.get_next_helo_domain(None), "mx.alpha.org");
    }

    #[test]
    fn test_empty_pools_fall_back() {
        let rotation = RotationService::new(vec![" ".into()], vec![]);
        assert_eq!(rotation.get_next_helo_domain(None), "localhost");
        assert_eq!(rotation.get_next_from_address(None), "verify@localhost");
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("mx1.mail.Example.org."), "example.org");
        assert_eq!(registrable_domain("localhost"), "localhost");
    }
}
