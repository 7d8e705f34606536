use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

pub type DynDomainResolver = Arc<dyn DomainResolver>;

#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// `Ok(true)` once the domain has at least one address.
    async fn resolves(&self, domain: &str) -> std::io::Result<bool>;
}

/// Resolves through the host's configured resolver.
pub struct SystemResolver;

#[async_trait]
impl DomainResolver for SystemResolver {
    async fn resolves(&self, domain: &str) -> std::io::Result<bool> {
        let mut addrs = tokio::net::lookup_host((domain, 443)).await?;
        Ok(addrs.next().is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("domains did not resolve within {timeout_secs}s: {}", .domains.join(", "))]
pub struct DnsError {
    pub domains: Vec<String>,
    pub timeout_secs: u64,
}

/// Polls every distinct domain concurrently until it resolves or `budget` elapses.
pub async fn wait_resolvable(
    resolver: &dyn DomainResolver,
    domains: &[String],
    budget: Duration,
    poll_interval: Duration,
) -> Result<(), DnsError> {
    let distinct: BTreeSet<&str> = domains.iter().map(String::as_str).collect();
    if distinct.is_empty() {
        return Ok(());
    }

    let checks = distinct.iter().map(|domain| async move {
        let resolved = poll_domain(resolver, domain, budget, poll_interval).await;
        (*domain, resolved)
    });
    let unresolved: Vec<String> = join_all(checks)
        .await
        .into_iter()
        .filter(|(_, resolved)| !resolved)
        .map(|(domain, _)| domain.to_string())
        .collect();

    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(DnsError {
            domains: unresolved,
            timeout_secs: budget.as_secs(),
        })
    }
}

async fn poll_domain(
    resolver: &dyn DomainResolver,
    domain: &str,
    budget: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, resolver.resolves(domain)).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) => debug!(%domain, "domain has no addresses yet"),
            Ok(Err(err)) => debug!(%domain, error = %err, "domain lookup failed; retrying"),
            Err(_) => debug!(%domain, "domain lookup timed out"),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        sleep(poll_interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a script per domain; the last answer repeats.
    #[derive(Default)]
    struct ScriptedResolver {
        answers: Mutex<HashMap<String, Vec<Option<bool>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedResolver {
        fn with(domain: &str, answers: Vec<Option<bool>>) -> Self {
            let resolver = Self::default();
            resolver.add(domain, answers);
            resolver
        }

        fn add(&self, domain: &str, answers: Vec<Option<bool>>) {
            self.answers
                .lock()
                .expect("answers")
                .insert(domain.to_string(), answers);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl DomainResolver for ScriptedResolver {
        async fn resolves(&self, domain: &str) -> std::io::Result<bool> {
            self.calls.lock().expect("calls").push(domain.to_string());
            let mut answers = self.answers.lock().expect("answers");
            let script = answers.entry(domain.to_string()).or_default();
            let answer = if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().copied().unwrap_or(Some(false))
            };
            match answer {
                Some(resolved) => Ok(resolved),
                None => Err(std::io::Error::other("SERVFAIL")),
            }
        }
    }

    const BUDGET: Duration = Duration::from_millis(300);
    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn empty_domain_list_makes_no_lookups() {
        let resolver = ScriptedResolver::default();
        wait_resolvable(&resolver, &[], BUDGET, POLL)
            .await
            .expect("trivial success");
        assert!(resolver.calls().is_empty());
    }

    #[tokio::test]
    async fn lookup_errors_are_retried_until_resolved() {
        let resolver = ScriptedResolver::with("api.example.com", vec![None, Some(false), Some(true)]);
        wait_resolvable(&resolver, &["api.example.com".to_string()], BUDGET, POLL)
            .await
            .expect("resolves eventually");
        assert_eq!(resolver.calls().len(), 3);
    }

    #[tokio::test]
    async fn unresolved_domains_are_named_in_one_error() {
        let resolver = ScriptedResolver::with("ok.example.com", vec![Some(true)]);
        resolver.add("missing.example.com", vec![Some(false)]);
        resolver.add("broken.example.com", vec![None]);

        let domains = [
            "ok.example.com".to_string(),
            "missing.example.com".to_string(),
            "broken.example.com".to_string(),
            "missing.example.com".to_string(),
        ];
        let started = std::time::Instant::now();
        let err = wait_resolvable(&resolver, &domains, BUDGET, POLL)
            .await
            .unwrap_err();

        assert_eq!(err.domains, ["broken.example.com", "missing.example.com"]);
        assert!(err.to_string().contains("missing.example.com"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Lookups for `slow.example.com` never return in time; everything else resolves.
    struct StalledResolver;

    #[async_trait]
    impl DomainResolver for StalledResolver {
        async fn resolves(&self, domain: &str) -> std::io::Result<bool> {
            if domain == "slow.example.com" {
                sleep(Duration::from_secs(30)).await;
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn stalled_lookup_is_cut_off_at_the_budget() {
        let domains = ["slow.example.com".to_string(), "fast.example.com".to_string()];
        let started = std::time::Instant::now();
        let result = timeout(
            Duration::from_secs(3),
            wait_resolvable(&StalledResolver, &domains, BUDGET, POLL),
        )
        .await
        .expect("dns gate must stop at its own budget");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.unwrap_err().domains, ["slow.example.com"]);
    }
}
