//! `HostMatch`: the routing oracle that decides whether a destination host
//! goes direct or through the tunnel. Exposed as a trait so callers can
//! plug in their own matcher; `SuffixHostMatcher` is the minimal concrete
//! implementation that ships with the binary.

use async_trait::async_trait;

/// Returns `(matched, flags)`. `flags == 1` means "route through the
/// tunnel"; any other value (only `0` is defined) means direct.
#[async_trait]
pub trait HostMatch: Send + Sync {
    async fn lookup(&self, host: &str) -> (bool, i32);
}

/// Suffix-list matcher: tunnels any host sharing a configured domain suffix.
/// IP-literal destinations never reach this (callers only consult
/// `HostMatch` for domain names).
pub struct SuffixHostMatcher {
    suffixes: Vec<String>,
}

impl SuffixHostMatcher {
    pub fn new(suffixes: Vec<String>) -> Self {
        SuffixHostMatcher { suffixes }
    }
}

#[async_trait]
impl HostMatch for SuffixHostMatcher {
    async fn lookup(&self, host: &str) -> (bool, i32) {
        let host = host.trim_end_matches('.');
        for suffix in &self.suffixes {
            if host == suffix || host.ends_with(&format!(".{}", suffix)) {
                return (true, 1);
            }
        }
        (false, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matches_exact_and_subdomain() {
        let m = SuffixHostMatcher::new(vec!["example.com".to_string()]);
        assert_eq!(m.lookup("example.com").await, (true, 1));
        assert_eq!(m.lookup("www.example.com").await, (true, 1));
        assert_eq!(m.lookup("notexample.com").await, (false, 0));
        assert_eq!(m.lookup("other.org").await, (false, 0));
    }
}
