//! Which sites FanFicFare can update from.

use super::FanFicFare;
use crate::error::Result;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

/// Matches the example URL bullets in `--sites-list` output.
static EXAMPLE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\*\s*(\w+://[^/]+)").unwrap());

/// Registrable domains supported by the updater.
///
/// Built once at startup and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteRegistry {
    domains: HashSet<String>,
}

impl SiteRegistry {
    /// Create a registry from known domains.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
        }
    }

    /// Ask the updater for its site list.
    pub async fn discover(fanficfare: &FanFicFare) -> Result<Self> {
        let listing = fanficfare.run(["--sites-list"]).await?;
        let registry = Self::from_listing(&listing);
        tracing::info!(sites = registry.len(), "Discovered supported sites");
        Ok(registry)
    }

    /// Collect domains from `--sites-list` text. Unusable lines are skipped.
    pub fn from_listing(listing: &str) -> Self {
        let domains = listing
            .lines()
            .filter_map(|line| EXAMPLE_URL.captures(line))
            .filter_map(|caps| Url::parse(&caps[1]).ok())
            .filter_map(|url| url.domain().and_then(registrable_domain))
            .collect();
        Self { domains }
    }

    /// Whether `domain` is supported.
    pub fn is_supported(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    /// Number of supported domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether no domain is supported.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Supported domains, sorted.
    pub fn sorted(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.domains.iter().map(String::as_str).collect();
        domains.sort_unstable();
        domains
    }
}

/// Effective TLD plus one label, e.g. `www.example.co.uk` -> `example.co.uk`.
pub fn registrable_domain(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    psl::domain_str(&host).map(str::to_string)
}
