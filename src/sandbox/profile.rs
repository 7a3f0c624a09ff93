//! OS sandbox profile files.
//!
//! Written alongside each child's working directory for audit: a Seatbelt
//! profile on macOS, a seccomp descriptor on Linux. Not every OS enforces
//! them; the file documents the intended confinement either way.

use std::path::{Path, PathBuf};

use crate::gears::GearManifest;
use crate::types::Result;

/// Write the platform profile next to the child's working directory.
/// Returns the profile path.
pub fn write_profile(work_dir: &Path, manifest: &GearManifest, workspace: &Path) -> Result<PathBuf> {
    if cfg!(target_os = "macos") {
        let path = work_dir.join("sandbox.sb");
        std::fs::write(&path, seatbelt_profile(manifest, workspace))?;
        Ok(path)
    } else {
        let path = work_dir.join("seccomp.json");
        std::fs::write(&path, seccomp_profile(manifest))?;
        Ok(path)
    }
}

/// Seatbelt policy: deny-by-default, allow workspace and declared reads.
fn seatbelt_profile(manifest: &GearManifest, workspace: &Path) -> String {
    let mut profile = String::from("(version 1)\n(deny default)\n");
    profile.push_str("(allow process-exec)\n(allow process-fork)\n");
    profile.push_str(&format!(
        "(allow file-read* file-write* (subpath \"{}\"))\n",
        workspace.display()
    ));
    if let Some(fs) = &manifest.permissions.filesystem {
        for path in &fs.read {
            profile.push_str(&format!("(allow file-read* (subpath \"{}\"))\n", path));
        }
        for path in &fs.write {
            profile.push_str(&format!("(allow file-write* (subpath \"{}\"))\n", path));
        }
    }
    if manifest.permissions.network.is_some() {
        profile.push_str("(allow network-outbound)\n");
    }
    profile
}

/// Seccomp descriptor: a syscall allowlist plus declared capabilities,
/// serialized for audit tooling.
fn seccomp_profile(manifest: &GearManifest) -> String {
    let network = manifest.permissions.network.is_some();
    let descriptor = serde_json::json!({
        "defaultAction": "SCMP_ACT_ERRNO",
        "syscalls": [{
            "action": "SCMP_ACT_ALLOW",
            "names": [
                "read", "write", "close", "fstat", "lseek", "mmap", "munmap",
                "brk", "rt_sigaction", "rt_sigreturn", "futex", "exit_group",
                "openat", "getrandom", "clock_gettime"
            ],
        }],
        "capabilities": {
            "network": network,
            "shell": manifest.permissions.shell,
        },
        "gear": manifest.id,
    });
    descriptor.to_string()
}
