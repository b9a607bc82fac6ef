//! Origin allowlist compilation and matching.
//!
//! Supports `*`, exact origins, and a single leading subdomain wildcard
//! (`https://*.example.com`). An optional validator callback runs after the
//! allowlist. Rejected origins are dropped silently.

use std::fmt;
use std::sync::Arc;

use postrpc_core::error::{Result, RpcError};

/// Compiled allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginRule {
    Any,
    Exact(String),
    /// `scheme://*.suffix`: scheme plus a dot-prefixed host suffix.
    Subdomain { scheme: String, suffix: String },
}

impl OriginRule {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(OriginRule::Any);
        }
        let (scheme, host) = raw.split_once("://").ok_or_else(|| {
            RpcError::InvalidConfig(format!("invalid origin: {raw} (expected scheme://host)"))
        })?;
        if let Some(rest) = host.strip_prefix("*.") {
            if rest.is_empty() || rest.contains('*') {
                return Err(RpcError::InvalidConfig(format!("invalid origin wildcard: {raw}")));
            }
            return Ok(OriginRule::Subdomain {
                scheme: scheme.to_string(),
                suffix: format!(".{rest}"),
            });
        }
        if host.contains('*') {
            return Err(RpcError::InvalidConfig(format!("invalid origin wildcard: {raw}")));
        }
        Ok(OriginRule::Exact(raw.to_string()))
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            OriginRule::Any => true,
            OriginRule::Exact(o) => o == origin,
            OriginRule::Subdomain { scheme, suffix } => origin
                .split_once("://")
                .map(|(s, host)| s == scheme && host.len() > suffix.len() && host.ends_with(suffix.as_str()))
                .unwrap_or(false),
        }
    }
}

type Validator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Allowlist plus optional custom validator. Empty allowlist admits all.
#[derive(Clone, Default)]
pub struct OriginPolicy {
    rules: Vec<OriginRule>,
    validator: Option<Validator>,
}

impl OriginPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn from_allowlist(raw: &[String]) -> Result<Self> {
        let rules = raw
            .iter()
            .map(|s| OriginRule::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, validator: None })
    }

    pub fn with_validator(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn allows(&self, origin: &str) -> bool {
        if !self.rules.is_empty() && !self.rules.iter().any(|r| r.matches(origin)) {
            return false;
        }
        match &self.validator {
            Some(v) => v(origin),
            None => true,
        }
    }
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginPolicy")
            .field("rules", &self.rules)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_subdomains_only() {
        let r = OriginRule::parse("https://*.example.com").unwrap();
        assert!(r.matches("https://app.example.com"));
        assert!(r.matches("https://a.b.example.com"));
        assert!(!r.matches("https://example.com"));
        assert!(!r.matches("http://app.example.com"));
        assert!(!r.matches("https://evilexample.com"));
    }

    #[test]
    fn invalid_entries_fail_compile() {
        assert!(OriginRule::parse("example.com").is_err());
        assert!(OriginRule::parse("https://a*.example.com").is_err());
    }

    #[test]
    fn validator_runs_after_allowlist() {
        let p = OriginPolicy::from_allowlist(&["https://a.test".into(), "https://b.test".into()])
            .unwrap()
            .with_validator(|o| o != "https://b.test");
        assert!(p.allows("https://a.test"));
        assert!(!p.allows("https://b.test"));
        assert!(!p.allows("https://c.test"));
        assert!(OriginPolicy::allow_all().allows("null"));
    }
}
