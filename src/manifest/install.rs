//! Install, verify and remove manifests in the well-known search roots.
//!
//! These helpers are for developers and test setups that need a helper to be
//! discoverable; the bridge itself only ever reads manifests.

use super::{
    is_safe_lookup_name, is_valid_name,
    paths::{self, Scope, SlugStyle},
    ManifestType, NativeManifest, PathStyle,
};
use crate::error::{BridgeError, Result};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::info;

fn invalid(msg: String) -> BridgeError {
    BridgeError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

fn check_installable(manifest: &NativeManifest) -> Result<()> {
    let name_ok = match manifest.kind {
        ManifestType::Storage => is_safe_lookup_name(&manifest.name),
        _ => is_valid_name(&manifest.name),
    };
    if !name_ok {
        return Err(invalid(format!("invalid manifest name {:?}", manifest.name)));
    }
    if manifest.kind == ManifestType::Stdio && PathStyle::native() == PathStyle::Posix {
        let exe = manifest.path.as_deref().unwrap_or_default();
        if !PathStyle::Posix.is_absolute(exe) {
            return Err(invalid(format!(
                "stdio manifest path must be absolute on this platform, got {exe:?}"
            )));
        }
    }
    Ok(())
}

fn root_for(scope: Scope) -> Result<PathBuf> {
    paths::scope_roots(scope)
        .into_iter()
        .next()
        .ok_or_else(|| invalid(format!("no {scope:?} manifest directory on this platform")))
}

/// Write `manifest` as `<root>/<slug>/<name>.json` and return the file path.
pub fn install_manifest_in(
    root: &Path,
    slugs: SlugStyle,
    manifest: &NativeManifest,
) -> Result<PathBuf> {
    check_installable(manifest)?;
    let file = paths::manifest_file(root, manifest.kind, slugs, &manifest.name);
    if let Some(dir) = file.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&file, json)?;
    info!(path = %file.display(), name = %manifest.name, "installed native manifest");
    Ok(file)
}

/// Install into the first root of `scope` for this OS.
///
/// With the `windows-registry` feature on Windows, user installs are also
/// registered under HKCU so the registry locator can find them.
pub fn install_manifest(manifest: &NativeManifest, scope: Scope) -> Result<PathBuf> {
    let file = install_manifest_in(&root_for(scope)?, SlugStyle::native(), manifest)?;
    #[cfg(all(windows, feature = "windows-registry"))]
    if scope == Scope::User {
        super::winreg::register_manifest(manifest.kind, &manifest.name, &file)?;
    }
    Ok(file)
}

/// Remove the manifest file for `(kind, name)`. Returns whether a file was removed.
pub fn remove_manifest(kind: ManifestType, name: &str, scope: Scope) -> Result<bool> {
    if !is_safe_lookup_name(name) {
        return Err(invalid(format!("invalid manifest name {name:?}")));
    }
    #[cfg(all(windows, feature = "windows-registry"))]
    if scope == Scope::User {
        super::winreg::unregister_manifest(kind, name)?;
    }
    let mut removed = false;
    for root in paths::scope_roots(scope) {
        let file = paths::manifest_file(&root, kind, SlugStyle::native(), name);
        if file.exists() {
            fs::remove_file(&file)?;
            info!(path = %file.display(), "removed native manifest");
            removed = true;
        }
    }
    Ok(removed)
}

/// Whether a manifest file for `(kind, name)` exists in `scope`.
pub fn verify_installed(kind: ManifestType, name: &str, scope: Scope) -> Result<bool> {
    if !is_safe_lookup_name(name) {
        return Ok(false);
    }
    Ok(paths::scope_roots(scope)
        .iter()
        .any(|root| paths::manifest_file(root, kind, SlugStyle::native(), name).exists()))
}
