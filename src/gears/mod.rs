//! Gears - externally developed plugins.
//!
//! A gear ships a manifest (identity, actions, capability grants,
//! resource limits) and a package file whose SHA-256 is its checksum.
//! The registry persists both and keeps a copy-on-write cache of the
//! enabled set for synchronous lookups.

pub mod manifest;
pub mod registry;

pub use manifest::{
    package_signing_digest, scan_manifest, GearAction, GearManifest, GearOrigin,
    GearPermissions, GearResources, VulnIssue,
};
pub use registry::{CachedGear, GearRegistry};
