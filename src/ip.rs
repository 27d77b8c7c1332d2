//! Public IP lookups and change verification after a tunnel rotation.

use log::{debug, info, warn};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::errors::{ShiftError, ShiftResult};
use crate::retry::{retry, RetryOutcome, RetryPolicy};

pub const DEFAULT_RESOLVER_URL: &str = "https://api.ipify.org";

/// Source of the externally visible address
#[cfg_attr(test, mockall::automock)]
pub trait IpResolver: Send + Sync {
    /// One lookup. Network failures are `Fetch` errors.
    fn fetch(&self) -> ShiftResult<String>;
}

/// Plain-text "what is my IP" endpoint over HTTP
pub struct HttpResolver {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpResolver {
    pub fn new(url: &str, timeout: Duration) -> ShiftResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ShiftError::Fetch(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

impl IpResolver for HttpResolver {
    fn fetch(&self) -> ShiftResult<String> {
        debug!("Fetching public IP from {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ShiftError::Fetch(e.to_string()))?;
        let body = response
            .text()
            .map_err(|e| ShiftError::Fetch(e.to_string()))?;
        Ok(body.trim().to_string())
    }
}

/// Result of waiting for the public IP to move away from the baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpChange {
    Changed(String),
    Unchanged,
}

/// Four dot-separated groups of 1-3 digits. No range check.
pub fn is_valid_ipv4(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|g| (1..=3).contains(&g.len()) && g.bytes().all(|b| b.is_ascii_digit()))
}

pub struct IpVerifier {
    resolver: Box<dyn IpResolver>,
}

impl IpVerifier {
    pub fn new(resolver: Box<dyn IpResolver>) -> Self {
        Self { resolver }
    }

    /// Fetch the current public IP, rejecting anything that is not dotted-quad
    pub fn fetch(&self) -> ShiftResult<String> {
        let ip = self.resolver.fetch()?;
        if is_valid_ipv4(&ip) {
            Ok(ip)
        } else {
            Err(ShiftError::Fetch(format!("resolver returned '{}'", ip)))
        }
    }

    /// Poll until a valid IP different from `baseline` shows up.
    ///
    /// Fetch failures count as unchanged attempts. Running out of attempts or
    /// being cancelled yields `Unchanged`; neither is an error.
    pub fn wait_for_change(
        &self,
        baseline: &str,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> IpChange {
        let outcome = retry("IP change check", policy, cancel, |attempt| {
            let ip = self.fetch()?;
            if ip == baseline {
                debug!("Attempt {}: public IP still {}", attempt, ip);
                Err(ShiftError::Fetch(format!("public IP unchanged ({})", ip)))
            } else {
                Ok(ip)
            }
        });

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                info!(
                    "Public IP changed {} -> {} (after {} check(s))",
                    baseline, value, attempts
                );
                IpChange::Changed(value)
            }
            RetryOutcome::Exhausted { attempts, .. } => {
                warn!(
                    "Public IP still {} after {} check(s); the rotation may not have taken effect",
                    baseline, attempts
                );
                IpChange::Unchanged
            }
            RetryOutcome::Cancelled { .. } => IpChange::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn dotted_quad_check() {
        assert!(is_valid_ipv4("1.2.3.4"));
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(is_valid_ipv4("999.0.0.1"));
        assert!(!is_valid_ipv4("1.2.3"));
        assert!(!is_valid_ipv4("1.2.3.4.5"));
        assert!(!is_valid_ipv4("a.b.c.d"));
        assert!(!is_valid_ipv4("1..3.4"));
        assert!(!is_valid_ipv4("<html>"));
        assert!(!is_valid_ipv4("2001:db8::1"));
    }

    #[test]
    fn detects_change_on_third_attempt() {
        let mut resolver = MockIpResolver::new();
        let mut seq = Sequence::new();
        for ip in ["1.2.3.4", "1.2.3.4", "5.6.7.8"] {
            resolver
                .expect_fetch()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move || Ok(ip.to_string()));
        }

        let verifier = IpVerifier::new(Box::new(resolver));
        let change = verifier.wait_for_change("1.2.3.4", fast(3), &CancellationToken::new());
        assert_eq!(change, IpChange::Changed("5.6.7.8".to_string()));
    }

    #[test]
    fn unchanged_after_budget() {
        let mut resolver = MockIpResolver::new();
        resolver
            .expect_fetch()
            .times(3)
            .returning(|| Ok("1.2.3.4".to_string()));

        let verifier = IpVerifier::new(Box::new(resolver));
        let change = verifier.wait_for_change("1.2.3.4", fast(3), &CancellationToken::new());
        assert_eq!(change, IpChange::Unchanged);
    }

    #[test]
    fn fetch_failures_and_garbage_count_as_unchanged() {
        let mut resolver = MockIpResolver::new();
        let mut seq = Sequence::new();
        resolver
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(ShiftError::Fetch("timeout".to_string())));
        resolver
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok("<html>rate limited</html>".to_string()));

        let verifier = IpVerifier::new(Box::new(resolver));
        let change = verifier.wait_for_change("1.2.3.4", fast(2), &CancellationToken::new());
        assert_eq!(change, IpChange::Unchanged);
    }

    #[test]
    fn cancelled_wait_does_not_fetch() {
        let mut resolver = MockIpResolver::new();
        resolver.expect_fetch().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let verifier = IpVerifier::new(Box::new(resolver));
        assert_eq!(
            verifier.wait_for_change("1.2.3.4", fast(5), &cancel),
            IpChange::Unchanged
        );
    }
}
