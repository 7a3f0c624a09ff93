//! Gear manifests.
//!
//! A manifest declares a gear's identity, actions, capability grants, and
//! resource limits. Validation runs at install time; the vulnerability
//! scan refuses capability combinations that have no business in
//! third-party gears.

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Where a gear came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GearOrigin {
    Builtin,
    User,
    Journal,
}

impl GearOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            GearOrigin::Builtin => "builtin",
            GearOrigin::User => "user",
            GearOrigin::Journal => "journal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "builtin" => Some(GearOrigin::Builtin),
            "user" => Some(GearOrigin::User),
            "journal" => Some(GearOrigin::Journal),
            _ => None,
        }
    }
}

/// One invocable action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GearAction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilesystemPermissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkPermissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
}

/// Capability grants. Everything defaults to "nothing".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GearPermissions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPermissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPermissions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
}

/// Resource limits. Defaults: 256 MiB, 50% CPU, 300 s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GearResources {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u8,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_network_bytes_per_call: Option<u64>,
}

impl Default for GearResources {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_cpu_percent: 50,
            timeout_ms: 300_000,
            max_network_bytes_per_call: None,
        }
    }
}

/// A gear's declared identity and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GearManifest {
    /// Lowercase letters/digits/hyphen, letter-initial, at most 64 chars.
    pub id: String,
    pub name: String,
    /// Semver.
    pub version: String,
    pub description: String,
    pub author: String,
    /// SPDX identifier.
    pub license: String,
    pub origin: GearOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(default)]
    pub draft: bool,

    pub actions: Vec<GearAction>,

    #[serde(default)]
    pub permissions: GearPermissions,

    /// Defaults applied post-validation when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<GearResources>,
}

impl GearManifest {
    /// Structural validation of every declared constraint.
    pub fn validate(&self) -> Result<()> {
        validate_gear_id(&self.id)?;
        if self.name.trim().is_empty() {
            return Err(Error::validation("manifest name must not be empty"));
        }
        validate_semver(&self.version)?;
        if self.license.trim().is_empty() || self.license.contains(char::is_whitespace) {
            return Err(Error::validation(format!(
                "license {:?} is not an SPDX identifier",
                self.license
            )));
        }
        if self.actions.is_empty() {
            return Err(Error::validation("manifest declares no actions"));
        }
        for action in &self.actions {
            if action.name.trim().is_empty() {
                return Err(Error::validation("action name must not be empty"));
            }
        }
        Ok(())
    }

    /// Resource limits with defaults applied.
    pub fn effective_resources(&self) -> GearResources {
        self.resources.unwrap_or_default()
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.iter().any(|a| a.name == name)
    }
}

/// A finding from the vulnerability scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnIssue {
    pub code: &'static str,
    pub message: String,
}

pub const VULN_SHELL_WITH_NETWORK: &str = "VULN_SHELL_WITH_NETWORK";
pub const VULN_WILDCARD_FILESYSTEM: &str = "VULN_WILDCARD_FILESYSTEM";
pub const VULN_WILDCARD_NETWORK: &str = "VULN_WILDCARD_NETWORK";
pub const VULN_EXCESSIVE_SECRETS: &str = "VULN_EXCESSIVE_SECRETS";
pub const VULN_SHELL_DEFAULT_ENABLED: &str = "VULN_SHELL_DEFAULT_ENABLED";

/// Flag capability combinations that fail installation. Builtin gears
/// bypass the non-builtin checks.
pub fn scan_manifest(manifest: &GearManifest) -> Vec<VulnIssue> {
    let mut issues = Vec::new();
    let builtin = manifest.origin == GearOrigin::Builtin;
    let permissions = &manifest.permissions;

    if permissions.shell && permissions.network.is_some() {
        issues.push(VulnIssue {
            code: VULN_SHELL_WITH_NETWORK,
            message: "shell access combined with network access".to_string(),
        });
    }

    if !builtin {
        if let Some(fs) = &permissions.filesystem {
            let wildcard = fs
                .read
                .iter()
                .chain(fs.write.iter())
                .any(|p| p == "*" || p == "**" || p == "/");
            if wildcard {
                issues.push(VulnIssue {
                    code: VULN_WILDCARD_FILESYSTEM,
                    message: "wildcard filesystem grant on non-builtin gear".to_string(),
                });
            }
        }
        if let Some(network) = &permissions.network {
            if network.domains.iter().any(|d| d == "*") {
                issues.push(VulnIssue {
                    code: VULN_WILDCARD_NETWORK,
                    message: "wildcard network grant on non-builtin gear".to_string(),
                });
            }
        }
        if permissions.shell {
            issues.push(VulnIssue {
                code: VULN_SHELL_DEFAULT_ENABLED,
                message: "shell access on non-builtin gear".to_string(),
            });
        }
    }

    if permissions.secrets.len() > 10 {
        issues.push(VulnIssue {
            code: VULN_EXCESSIVE_SECRETS,
            message: format!("{} secrets requested (limit 10)", permissions.secrets.len()),
        });
    }

    issues
}

/// The digest a package signature covers:
/// `sha256(canonicalManifestJSON || fileBytes)`. The manifest is
/// canonicalized without its `signature` and `checksum` fields, since
/// both are populated after signing.
pub fn package_signing_digest(manifest: &GearManifest, package_bytes: &[u8]) -> Result<String> {
    let mut unsigned = manifest.clone();
    unsigned.signature = None;
    unsigned.checksum = None;
    let canonical =
        crate::envelope::signing::canonical_json(&serde_json::to_value(&unsigned)?);

    let mut input = canonical.into_bytes();
    input.extend_from_slice(package_bytes);
    Ok(crate::envelope::signing::sha256_hex(&input))
}

fn validate_gear_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(Error::validation(format!(
            "gear id {:?} must be lowercase letters/digits/hyphen, letter-initial, <= 64 chars",
            id
        )));
    }
    Ok(())
}

fn validate_semver(version: &str) -> Result<()> {
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return Err(Error::validation(format!(
            "version {:?} is not semver",
            version
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn manifest(id: &str, origin: GearOrigin) -> GearManifest {
        GearManifest {
            id: id.to_string(),
            name: "File Manager".to_string(),
            version: "1.2.0".to_string(),
            description: "Reads and writes workspace files".to_string(),
            author: "aegis".to_string(),
            license: "Apache-2.0".to_string(),
            origin,
            checksum: None,
            signature: None,
            draft: false,
            actions: vec![GearAction {
                name: "read_file".to_string(),
                description: None,
                parameters: None,
            }],
            permissions: GearPermissions::default(),
            resources: None,
        }
    }

    #[test]
    fn test_valid_manifest() {
        assert!(manifest("file-manager", GearOrigin::User).validate().is_ok());
    }

    #[test]
    fn test_id_constraints() {
        for bad in ["", "File-Manager", "1manager", "-lead", "has_underscore", &"x".repeat(65)] {
            assert!(
                manifest(bad, GearOrigin::User).validate().is_err(),
                "id {:?} should fail",
                bad
            );
        }
        assert!(manifest("a", GearOrigin::User).validate().is_ok());
        assert!(manifest("gear-2", GearOrigin::User).validate().is_ok());
    }

    #[test]
    fn test_semver_constraints() {
        let mut m = manifest("gear", GearOrigin::User);
        for good in ["0.1.0", "10.20.30", "1.0.0-beta.1", "2.0.0+build5"] {
            m.version = good.to_string();
            assert!(m.validate().is_ok(), "version {:?} should pass", good);
        }
        for bad in ["1.0", "v1.0.0", "1.0.x", ""] {
            m.version = bad.to_string();
            assert!(m.validate().is_err(), "version {:?} should fail", bad);
        }
    }

    #[test]
    fn test_license_must_be_spdx_token() {
        let mut m = manifest("gear", GearOrigin::User);
        m.license = "MIT License".to_string();
        assert!(m.validate().is_err());
        m.license = "MIT".to_string();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_actions_required() {
        let mut m = manifest("gear", GearOrigin::User);
        m.actions.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_resource_defaults() {
        let m = manifest("gear", GearOrigin::User);
        let resources = m.effective_resources();
        assert_eq!(resources.max_memory_mb, 256);
        assert_eq!(resources.max_cpu_percent, 50);
        assert_eq!(resources.timeout_ms, 300_000);
    }

    #[test]
    fn test_scan_shell_with_network() {
        let mut m = manifest("gear", GearOrigin::Builtin);
        m.permissions.shell = true;
        m.permissions.network = Some(NetworkPermissions {
            domains: vec!["api.example.com".to_string()],
            protocols: vec!["https".to_string()],
        });
        let codes: Vec<&str> = scan_manifest(&m).iter().map(|i| i.code).collect();
        assert!(codes.contains(&VULN_SHELL_WITH_NETWORK));
    }

    #[test]
    fn test_scan_wildcards_non_builtin_only() {
        let mut m = manifest("gear", GearOrigin::User);
        m.permissions.filesystem = Some(FilesystemPermissions {
            read: vec!["*".to_string()],
            write: vec![],
        });
        m.permissions.network = Some(NetworkPermissions {
            domains: vec!["*".to_string()],
            protocols: vec![],
        });
        let codes: Vec<&str> = scan_manifest(&m).iter().map(|i| i.code).collect();
        assert!(codes.contains(&VULN_WILDCARD_FILESYSTEM));
        assert!(codes.contains(&VULN_WILDCARD_NETWORK));

        // The same grants pass for builtin gears.
        m.origin = GearOrigin::Builtin;
        assert!(scan_manifest(&m).is_empty());
    }

    #[test]
    fn test_scan_shell_non_builtin() {
        let mut m = manifest("gear", GearOrigin::User);
        m.permissions.shell = true;
        let codes: Vec<&str> = scan_manifest(&m).iter().map(|i| i.code).collect();
        assert!(codes.contains(&VULN_SHELL_DEFAULT_ENABLED));
    }

    #[test]
    fn test_package_signing_digest_ignores_signature_fields() {
        let mut signed = manifest("gear", GearOrigin::User);
        let bytes = b"package contents";
        let digest = package_signing_digest(&signed, bytes).unwrap();
        assert_eq!(digest.len(), 64);

        // Populating signature and checksum does not move the digest.
        signed.signature = Some("c2ln".to_string());
        signed.checksum = Some("abc123".to_string());
        assert_eq!(package_signing_digest(&signed, bytes).unwrap(), digest);

        // Different package bytes do.
        assert_ne!(
            package_signing_digest(&signed, b"other contents").unwrap(),
            digest
        );
    }

    #[test]
    fn test_scan_excessive_secrets() {
        let mut m = manifest("gear", GearOrigin::Builtin);
        m.permissions.secrets = (0..11).map(|i| format!("secret-{}", i)).collect();
        let codes: Vec<&str> = scan_manifest(&m).iter().map(|i| i.code).collect();
        assert!(codes.contains(&VULN_EXCESSIVE_SECRETS));
    }
}
