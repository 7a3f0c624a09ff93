//! Secrets vault.
//!
//! Password-derived encryption at rest: Argon2id (two parameter tiers)
//! derives a 32-byte key, AES-256-GCM seals each entry. Names,
//! timestamps, and ACLs stay cleartext in the JSON envelope for listing;
//! values are never logged and decrypted buffers are zeroed after use.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::{Zeroize, Zeroizing};

use crate::types::{now_ms, Error, Result};

/// KDF hardness tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfTier {
    /// 64 MiB, t=3, p=1.
    Standard,
    /// 19 MiB, t=2, p=1 - for constrained hosts.
    LowPower,
}

impl KdfTier {
    fn params(self) -> Result<Params> {
        let (m_kib, t, p) = match self {
            KdfTier::Standard => (64 * 1024, 3, 1),
            KdfTier::LowPower => (19 * 1024, 2, 1),
        };
        Params::new(m_kib, t, p, Some(32))
            .map_err(|e| Error::crypto(format!("argon2 params: {}", e)))
    }
}

/// Known plaintext sealed at initialization; decrypting it proves the
/// password without storing any hash of it.
const VERIFIER_PLAINTEXT: &[u8] = b"aegis-vault-verifier-v1";

/// One sealed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedEntry {
    iv: String,
    auth_tag: String,
    ciphertext: String,
    allowed_plugins: Vec<String>,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotate_after_days: Option<u32>,
}

/// On-disk vault file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultFile {
    version: u8,
    salt: String,
    tier: KdfTier,
    verifier: SealedBlob,
    secrets: HashMap<String, SealedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedBlob {
    iv: String,
    auth_tag: String,
    ciphertext: String,
}

/// Listing row: metadata only, never values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretInfo {
    pub name: String,
    pub allowed_plugins: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub rotate_after_days: Option<u32>,
}

/// Options for storing a secret.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub rotate_after_days: Option<u32>,
}

#[derive(Default)]
struct VaultState {
    /// Derived key; present only while unlocked.
    key: Option<Zeroizing<[u8; 32]>>,
    file: Option<VaultFile>,
}

/// The password-derived secrets vault.
pub struct SecretsVault {
    path: PathBuf,
    state: Mutex<VaultState>,
}

impl std::fmt::Debug for SecretsVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material or entry contents.
        f.debug_struct("SecretsVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SecretsVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(VaultState::default()),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the vault file. Fails if one already exists.
    pub fn initialize(&self, password: &str, tier: KdfTier) -> Result<()> {
        if self.exists() {
            return Err(Error::conflict(format!(
                "vault already exists at {}",
                self.path.display()
            )));
        }

        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = derive_key(password, &salt, tier)?;

        let verifier = seal(&key, VERIFIER_PLAINTEXT, b"verifier")?;
        let file = VaultFile {
            version: 1,
            salt: base64::engine::general_purpose::STANDARD.encode(salt),
            tier,
            verifier,
            secrets: HashMap::new(),
        };
        self.write_file(&file)?;

        let mut state = self.lock()?;
        state.key = Some(key);
        state.file = Some(file);
        Ok(())
    }

    /// Derive the key from the password and prove it against the
    /// verifier blob.
    pub fn unlock(&self, password: &str) -> Result<()> {
        let file = self.read_file()?;
        let salt = base64::engine::general_purpose::STANDARD
            .decode(&file.salt)
            .map_err(|e| Error::crypto(format!("vault salt: {}", e)))?;
        let key = derive_key(password, &salt, file.tier)?;

        let opened = open(&key, &file.verifier, b"verifier")
            .map_err(|_| Error::auth("vault password incorrect"))?;
        if opened.as_slice() != VERIFIER_PLAINTEXT {
            return Err(Error::auth("vault password incorrect"));
        }

        let mut state = self.lock()?;
        state.key = Some(key);
        state.file = Some(file);
        Ok(())
    }

    /// Drop and zero the derived key.
    pub fn lock_vault(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.key = None; // Zeroizing handles the wipe.
        state.file = None;
        Ok(())
    }

    /// Seal and persist a secret. The caller's buffer is not consumed;
    /// callers should zero it themselves.
    pub fn store(
        &self,
        name: &str,
        value: &[u8],
        allowed_plugins: Vec<String>,
        options: StoreOptions,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::validation("secret name must not be empty"));
        }
        let mut state = self.lock()?;
        let key = state
            .key
            .as_ref()
            .ok_or_else(|| Error::auth("vault is locked"))?
            .clone();
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::auth("vault is locked"))?;

        let blob = seal(&key, value, name.as_bytes())?;
        file.secrets.insert(
            name.to_string(),
            SealedEntry {
                iv: blob.iv,
                auth_tag: blob.auth_tag,
                ciphertext: blob.ciphertext,
                allowed_plugins,
                created_at: now_ms(),
                last_used_at: None,
                rotate_after_days: options.rotate_after_days,
            },
        );
        let snapshot = file.clone();
        drop(state);
        self.write_file(&snapshot)
    }

    /// ACL-enforced retrieval. Returns a freshly allocated buffer the
    /// caller must zero (`Zeroizing` does it on drop).
    pub fn retrieve(&self, name: &str, requesting_plugin: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut state = self.lock()?;
        let key = state
            .key
            .as_ref()
            .ok_or_else(|| Error::auth("vault is locked"))?
            .clone();
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::auth("vault is locked"))?;

        let entry = file
            .secrets
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("secret {} not found", name)))?;
        if !entry.allowed_plugins.iter().any(|p| p == requesting_plugin) {
            // Log only the principal id, never capability details.
            tracing::warn!(plugin = requesting_plugin, "secret access denied");
            return Err(Error::secret_access(format!(
                "plugin {} may not read this secret",
                requesting_plugin
            )));
        }

        let blob = SealedBlob {
            iv: entry.iv.clone(),
            auth_tag: entry.auth_tag.clone(),
            ciphertext: entry.ciphertext.clone(),
        };
        entry.last_used_at = Some(now_ms());
        let snapshot = file.clone();
        drop(state);
        self.write_file(&snapshot)?;

        open(&key, &blob, name.as_bytes())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::auth("vault is locked"))?;
        if file.secrets.remove(name).is_none() {
            return Err(Error::not_found(format!("secret {} not found", name)));
        }
        let snapshot = file.clone();
        drop(state);
        self.write_file(&snapshot)
    }

    /// Metadata only.
    pub fn list(&self) -> Result<Vec<SecretInfo>> {
        let state = self.lock()?;
        let file = state
            .file
            .as_ref()
            .ok_or_else(|| Error::auth("vault is locked"))?;
        let mut infos: Vec<SecretInfo> = file
            .secrets
            .iter()
            .map(|(name, entry)| SecretInfo {
                name: name.clone(),
                allowed_plugins: entry.allowed_plugins.clone(),
                created_at: entry.created_at,
                last_used_at: entry.last_used_at,
                rotate_after_days: entry.rotate_after_days,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    /// Names of secrets older than their `rotateAfterDays`.
    pub fn rotation_check(&self) -> Result<Vec<String>> {
        let state = self.lock()?;
        let file = state
            .file
            .as_ref()
            .ok_or_else(|| Error::auth("vault is locked"))?;
        let now = now_ms();
        let mut due: Vec<String> = file
            .secrets
            .iter()
            .filter(|(_, entry)| {
                entry.rotate_after_days.is_some_and(|days| {
                    entry.created_at + Duration::days(days as i64) < now
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();
        Ok(due)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VaultState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("vault lock poisoned"))
    }

    fn read_file(&self) -> Result<VaultFile> {
        let json = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn write_file(&self, file: &VaultFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        write_private(&self.path, json.as_bytes())
    }
}

fn derive_key(password: &str, salt: &[u8], tier: KdfTier) -> Result<Zeroizing<[u8; 32]>> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, tier.params()?);
    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| Error::crypto(format!("key derivation: {}", e)))?;
    Ok(key)
}

fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<SealedBlob> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::crypto(format!("cipher init: {}", e)))?;
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| Error::crypto("encryption failed"))?;
    // aes-gcm appends the 16-byte tag; store it separately per the
    // on-disk format.
    let tag = sealed.split_off(sealed.len() - 16);

    let engine = &base64::engine::general_purpose::STANDARD;
    let blob = SealedBlob {
        iv: engine.encode(iv),
        auth_tag: engine.encode(&tag),
        ciphertext: engine.encode(&sealed),
    };
    sealed.zeroize();
    Ok(blob)
}

fn open(key: &[u8; 32], blob: &SealedBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let engine = &base64::engine::general_purpose::STANDARD;
    let iv = engine
        .decode(&blob.iv)
        .map_err(|e| Error::crypto(format!("iv: {}", e)))?;
    let tag = engine
        .decode(&blob.auth_tag)
        .map_err(|e| Error::crypto(format!("auth tag: {}", e)))?;
    let mut sealed = engine
        .decode(&blob.ciphertext)
        .map_err(|e| Error::crypto(format!("ciphertext: {}", e)))?;
    sealed.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::crypto(format!("cipher init: {}", e)))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), Payload { msg: &sealed, aad })
        .map_err(|_| Error::crypto("decryption failed"))?;
    Ok(Zeroizing::new(plaintext))
}

/// Write with owner-only permissions.
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(dir: &tempfile::TempDir) -> SecretsVault {
        SecretsVault::new(dir.path().join("vault.json"))
    }

    #[test]
    fn test_initialize_then_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("correct horse", KdfTier::LowPower).unwrap();

        // A second initialize refuses.
        assert!(v.initialize("other", KdfTier::LowPower).is_err());

        let reopened = vault(&dir);
        assert!(reopened.unlock("wrong password").is_err());
        reopened.unlock("correct horse").unwrap();
    }

    #[test]
    fn test_store_retrieve_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();

        v.store(
            "api-key",
            b"sk-123456",
            vec!["http-client".to_string()],
            StoreOptions::default(),
        )
        .unwrap();

        let value = v.retrieve("api-key", "http-client").unwrap();
        assert_eq!(value.as_slice(), b"sk-123456");
    }

    #[test]
    fn test_acl_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store(
            "api-key",
            b"sk-123456",
            vec!["http-client".to_string()],
            StoreOptions::default(),
        )
        .unwrap();

        let err = v.retrieve("api-key", "file-manager").unwrap_err();
        assert_eq!(err.code(), "SECRET_ACCESS_DENIED");
    }

    #[test]
    fn test_locked_vault_refuses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store("k", b"v", vec!["p".to_string()], StoreOptions::default())
            .unwrap();
        v.lock_vault().unwrap();

        assert!(v.retrieve("k", "p").is_err());
        assert!(v.list().is_err());
        assert!(v
            .store("k2", b"v", vec![], StoreOptions::default())
            .is_err());
    }

    #[test]
    fn test_list_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store(
            "api-key",
            b"super-secret",
            vec!["http-client".to_string()],
            StoreOptions {
                rotate_after_days: Some(30),
            },
        )
        .unwrap();

        let infos = v.list().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "api-key");
        assert_eq!(infos[0].rotate_after_days, Some(30));
        // Values never appear in the listing type.
        let json = serde_json::to_string(&infos).unwrap();
        assert!(!json.contains("super-secret"));
    }

    #[test]
    fn test_retrieve_updates_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store("k", b"v", vec!["p".to_string()], StoreOptions::default())
            .unwrap();
        assert!(v.list().unwrap()[0].last_used_at.is_none());

        v.retrieve("k", "p").unwrap();
        assert!(v.list().unwrap()[0].last_used_at.is_some());
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store("k", b"v", vec!["p".to_string()], StoreOptions::default())
            .unwrap();
        v.delete("k").unwrap();
        assert!(v.retrieve("k", "p").is_err());
        assert!(v.delete("k").is_err());
    }

    #[test]
    fn test_secrets_survive_relock() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store("k", b"v", vec!["p".to_string()], StoreOptions::default())
            .unwrap();

        let reopened = vault(&dir);
        reopened.unlock("pw").unwrap();
        assert_eq!(reopened.retrieve("k", "p").unwrap().as_slice(), b"v");
    }

    #[test]
    fn test_rotation_check() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store(
            "fresh",
            b"v",
            vec![],
            StoreOptions {
                rotate_after_days: Some(30),
            },
        )
        .unwrap();
        v.store("no-rotation", b"v", vec![], StoreOptions::default())
            .unwrap();

        // Nothing is due yet.
        assert!(v.rotation_check().unwrap().is_empty());
    }

    #[test]
    fn test_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let v = SecretsVault::new(&path);
        v.initialize("pw", KdfTier::LowPower).unwrap();
        v.store("k", b"v", vec!["p".to_string()], StoreOptions::default())
            .unwrap();

        // Flip bytes in the stored ciphertext.
        let mut file: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        file["secrets"]["k"]["ciphertext"] = serde_json::json!("dGFtcGVyZWQ=");
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let reopened = SecretsVault::new(&path);
        reopened.unlock("pw").unwrap();
        assert!(reopened.retrieve("k", "p").is_err());
    }
}
