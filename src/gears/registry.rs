//! Gear registry.
//!
//! CRUD over the `plugins` table plus an in-memory enabled-set cache.
//! The cache is copy-on-write: written only on install/enable/disable/
//! uninstall, read lock-free-in-spirit by planners and validators via a
//! shared `Arc` snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use crate::db::Database;
use crate::envelope::signing::sha256_hex;
use crate::gears::manifest::{scan_manifest, GearManifest, GearOrigin};
use crate::types::{now_ms, rfc3339_ms, Error, Result};

/// Cached record for an enabled gear.
#[derive(Debug, Clone)]
pub struct CachedGear {
    pub manifest: GearManifest,
    pub checksum: String,
    pub package_path: Option<PathBuf>,
    pub signature: Option<String>,
}

type Cache = Arc<HashMap<String, CachedGear>>;

/// The gear registry.
#[derive(Debug)]
pub struct GearRegistry {
    db: Database,
    cache: RwLock<Cache>,
}

impl GearRegistry {
    pub fn new(db: Database) -> Result<Self> {
        let registry = Self {
            db,
            cache: RwLock::new(Arc::new(HashMap::new())),
        };
        registry.load_cache()?;
        Ok(registry)
    }

    /// Install a gear from a package file. Fails on validation errors,
    /// any vulnerability finding, or an already-present id.
    pub fn install(&self, mut manifest: GearManifest, package_path: &Path) -> Result<GearManifest> {
        manifest.validate()?;
        let issues = scan_manifest(&manifest);
        if !issues.is_empty() {
            let codes: Vec<&str> = issues.iter().map(|i| i.code).collect();
            return Err(Error::validation(format!(
                "manifest for {} failed vulnerability scan: {}",
                manifest.id,
                codes.join(", ")
            )));
        }
        if self.get(&manifest.id)?.is_some() {
            return Err(Error::conflict(format!(
                "gear {} already installed; uninstall first",
                manifest.id
            )));
        }

        let package = std::fs::read(package_path)?;
        let checksum = sha256_hex(&package);
        manifest.checksum = Some(checksum.clone());

        self.persist(&manifest, &checksum, Some(package_path), true)?;
        self.cache_insert(CachedGear {
            manifest: manifest.clone(),
            checksum,
            package_path: Some(package_path.to_path_buf()),
            signature: manifest.signature.clone(),
        })?;
        info!(gear_id = %manifest.id, "gear installed");
        Ok(manifest)
    }

    /// Idempotent upsert for built-in gears; the checksum covers the
    /// canonical manifest since there is no package file.
    pub fn install_builtin(&self, mut manifest: GearManifest) -> Result<GearManifest> {
        if manifest.origin != GearOrigin::Builtin {
            return Err(Error::validation(format!(
                "gear {} is not builtin",
                manifest.id
            )));
        }
        manifest.validate()?;

        let canonical =
            crate::envelope::signing::canonical_json(&serde_json::to_value(&manifest)?);
        let checksum = sha256_hex(canonical.as_bytes());
        manifest.checksum = Some(checksum.clone());

        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM plugins WHERE id = ?1",
                params![manifest.id],
            )
        })?;
        self.persist(&manifest, &checksum, None, true)?;
        self.cache_insert(CachedGear {
            manifest: manifest.clone(),
            checksum,
            package_path: None,
            signature: manifest.signature.clone(),
        })?;
        Ok(manifest)
    }

    pub fn uninstall(&self, id: &str) -> Result<()> {
        let changed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM plugins WHERE id = ?1", params![id]))?;
        if changed == 0 {
            return Err(Error::not_found(format!("gear {} not installed", id)));
        }
        self.cache_remove(id)?;
        info!(gear_id = %id, "gear uninstalled");
        Ok(())
    }

    /// Fetch from the table regardless of enabled state.
    pub fn get(&self, id: &str) -> Result<Option<GearManifest>> {
        let row: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT manifest_json FROM plugins WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })?;
        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// All installed gears, optionally filtered to enabled ones.
    pub fn list(&self, enabled_only: bool) -> Result<Vec<GearManifest>> {
        let rows: Vec<String> = self.db.with_conn(|conn| {
            let sql = if enabled_only {
                "SELECT manifest_json FROM plugins WHERE enabled = 1 ORDER BY id"
            } else {
                "SELECT manifest_json FROM plugins ORDER BY id"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .collect()
    }

    pub fn enable(&self, id: &str) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute("UPDATE plugins SET enabled = 1 WHERE id = ?1", params![id])
        })?;
        if changed == 0 {
            return Err(Error::not_found(format!("gear {} not installed", id)));
        }
        // Reload the row into the cache.
        let cached = self.load_row(id)?;
        match cached {
            Some(gear) => self.cache_insert(gear),
            None => Ok(()),
        }
    }

    /// Disabling evicts from the lookup cache immediately.
    pub fn disable(&self, id: &str) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute("UPDATE plugins SET enabled = 0 WHERE id = ?1", params![id])
        })?;
        if changed == 0 {
            return Err(Error::not_found(format!("gear {} not installed", id)));
        }
        warn!(gear_id = %id, "gear disabled");
        self.cache_remove(id)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    /// Cache-only synchronous lookup for the planner and sandbox host.
    pub fn get_manifest(&self, id: &str) -> Option<GearManifest> {
        self.snapshot().get(id).map(|g| g.manifest.clone())
    }

    /// Cache-only lookup of the full cached record.
    pub fn get_cached(&self, id: &str) -> Option<CachedGear> {
        self.snapshot().get(id).cloned()
    }

    pub fn get_checksum(&self, id: &str) -> Result<String> {
        let checksum: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT checksum FROM plugins WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })?;
        checksum.ok_or_else(|| Error::not_found(format!("gear {} not installed", id)))
    }

    pub fn update_config(&self, id: &str, config: &HashMap<String, serde_json::Value>) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE plugins SET config_json = ?1 WHERE id = ?2",
                params![json, id],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found(format!("gear {} not installed", id)));
        }
        Ok(())
    }

    pub fn get_config(&self, id: &str) -> Result<HashMap<String, serde_json::Value>> {
        let json: Option<Option<String>> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT config_json FROM plugins WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })?;
        match json {
            None => Err(Error::not_found(format!("gear {} not installed", id))),
            Some(None) => Ok(HashMap::new()),
            Some(Some(json)) => Ok(serde_json::from_str(&json)?),
        }
    }

    /// Rebuild the enabled-set cache from the table.
    pub fn load_cache(&self) -> Result<()> {
        let ids: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM plugins WHERE enabled = 1")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })?;

        let mut fresh = HashMap::new();
        for id in ids {
            if let Some(gear) = self.load_row(&id)? {
                fresh.insert(id, gear);
            }
        }
        let mut cache = self
            .cache
            .write()
            .map_err(|_| Error::internal("gear cache lock poisoned"))?;
        *cache = Arc::new(fresh);
        Ok(())
    }

    fn load_row(&self, id: &str) -> Result<Option<CachedGear>> {
        let row: Option<(String, String, Option<String>, Option<String>)> =
            self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT manifest_json, checksum, package_path, signature
                     FROM plugins WHERE id = ?1 AND enabled = 1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
            })?;
        let Some((manifest_json, checksum, package_path, signature)) = row else {
            return Ok(None);
        };
        Ok(Some(CachedGear {
            manifest: serde_json::from_str(&manifest_json)?,
            checksum,
            package_path: package_path.map(PathBuf::from),
            signature,
        }))
    }

    fn persist(
        &self,
        manifest: &GearManifest,
        checksum: &str,
        package_path: Option<&Path>,
        enabled: bool,
    ) -> Result<()> {
        let manifest_json = serde_json::to_string(manifest)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO plugins
                     (id, name, version, manifest_json, origin, draft, installed_at,
                      enabled, signature, checksum, package_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    manifest.id,
                    manifest.name,
                    manifest.version,
                    manifest_json,
                    manifest.origin.as_str(),
                    manifest.draft,
                    rfc3339_ms(&now_ms()),
                    enabled,
                    manifest.signature,
                    checksum,
                    package_path.map(|p| p.to_string_lossy().into_owned()),
                ],
            )
        })?;
        Ok(())
    }

    fn snapshot(&self) -> Cache {
        self.cache
            .read()
            .map(|cache| Arc::clone(&cache))
            .unwrap_or_default()
    }

    fn cache_insert(&self, gear: CachedGear) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| Error::internal("gear cache lock poisoned"))?;
        let mut next: HashMap<String, CachedGear> = (**cache).clone();
        next.insert(gear.manifest.id.clone(), gear);
        *cache = Arc::new(next);
        Ok(())
    }

    fn cache_remove(&self, id: &str) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| Error::internal("gear cache lock poisoned"))?;
        let mut next: HashMap<String, CachedGear> = (**cache).clone();
        next.remove(id);
        *cache = Arc::new(next);
        Ok(())
    }
}
