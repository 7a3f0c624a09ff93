//! Validation policy configuration.
//!
//! Hard floors live here: workspace confinement for filesystem paths,
//! a domain allowlist with private-range refusal for network access, and
//! the transaction ceiling for financial actions.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use crate::types::{Error, Result};

/// Policy knobs the validator derives verdicts from.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Filesystem actions must stay under this root.
    pub workspace_root: PathBuf,
    /// Domain allowlist patterns (`example.com`, `*.example.org`).
    pub allowed_domains: Vec<String>,
    /// Financial actions above this amount are refused outright.
    pub max_transaction_amount_usd: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace"),
            allowed_domains: Vec::new(),
            max_transaction_amount_usd: 100.0,
        }
    }
}

/// Compiled policy with the domain globs built once.
#[derive(Debug)]
pub struct Policy {
    config: PolicyConfig,
    domain_set: GlobSet,
}

impl Policy {
    pub fn compile(config: PolicyConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.allowed_domains {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::validation(format!("bad domain pattern {:?}: {}", pattern, e)))?;
            builder.add(glob);
        }
        let domain_set = builder
            .build()
            .map_err(|e| Error::validation(format!("domain allowlist: {}", e)))?;
        Ok(Self { config, domain_set })
    }

    pub fn max_transaction_amount_usd(&self) -> f64 {
        self.config.max_transaction_amount_usd
    }

    /// A path is acceptable when it contains no `..` traversal and, if
    /// absolute, sits under the workspace root. Relative paths resolve
    /// against the workspace.
    pub fn path_allowed(&self, raw: &str) -> bool {
        let path = Path::new(raw);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return false;
        }
        if path.is_absolute() {
            return path.starts_with(&self.config.workspace_root);
        }
        true
    }

    /// A domain is acceptable when it matches the allowlist and is not a
    /// private or loopback address. IP literals in private ranges are
    /// refused regardless of the allowlist.
    pub fn domain_allowed(&self, host: &str) -> bool {
        if is_private_host(host) {
            return false;
        }
        self.domain_set.is_match(host)
    }
}

/// Loopback, link-local, and RFC-1918 hosts.
fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || v6.is_unspecified(),
        Err(_) => false,
    }
}

/// Pull the host out of a URL-ish string, if any.
pub fn host_of_url(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let authority = &rest[..end];
    // Strip userinfo and port.
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::compile(PolicyConfig {
            workspace_root: PathBuf::from("/workspace"),
            allowed_domains: vec!["api.example.com".into(), "*.trusted.org".into()],
            max_transaction_amount_usd: 100.0,
        })
        .unwrap()
    }

    #[test]
    fn test_paths_inside_workspace() {
        let policy = policy();
        assert!(policy.path_allowed("/workspace/test.txt"));
        assert!(policy.path_allowed("/workspace/sub/dir/file.rs"));
        assert!(policy.path_allowed("relative/file.txt"));
    }

    #[test]
    fn test_paths_outside_workspace_refused() {
        let policy = policy();
        assert!(!policy.path_allowed("/etc/passwd"));
        assert!(!policy.path_allowed("/workspace/../etc/passwd"));
        assert!(!policy.path_allowed("../secrets.txt"));
    }

    #[test]
    fn test_domain_allowlist() {
        let policy = policy();
        assert!(policy.domain_allowed("api.example.com"));
        assert!(policy.domain_allowed("files.trusted.org"));
        assert!(!policy.domain_allowed("evil.com"));
    }

    #[test]
    fn test_private_hosts_refused() {
        let policy = Policy::compile(PolicyConfig {
            allowed_domains: vec!["*".into()],
            ..Default::default()
        })
        .unwrap();
        for host in ["localhost", "127.0.0.1", "10.0.0.8", "192.168.1.1", "172.16.0.2", "169.254.0.1", "::1"] {
            assert!(!policy.domain_allowed(host), "{} should be refused", host);
        }
        assert!(policy.domain_allowed("example.com"));
    }

    #[test]
    fn test_host_of_url() {
        assert_eq!(host_of_url("https://api.example.com/v1/x"), Some("api.example.com"));
        assert_eq!(host_of_url("http://user@host.io:8080/p?q=1"), Some("host.io"));
        assert_eq!(host_of_url("ftp://nope"), None);
        assert_eq!(host_of_url("not a url"), None);
    }
}
