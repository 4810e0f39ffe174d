//! Manifest discovery strategies.
//!
//! A [`ManifestLocator`] turns `(type, name, caller)` into at most one
//! validated manifest. Which implementation is used is decided once, when the
//! [`Bridge`](crate::Bridge) is built.

use super::{
    is_safe_lookup_name, parse_manifest_with, paths, CallerContext, ManifestType, NativeManifest,
    PathStyle, ResolvedManifest, SlugStyle,
};
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};

pub trait ManifestLocator: Send + Sync {
    /// Find the first valid manifest. Failures are logged, never returned.
    fn lookup(&self, kind: ManifestType, name: &str, caller: &CallerContext)
        -> Option<ResolvedManifest>;
}

/// Read and validate one manifest file.
///
/// A missing file is expected during a directory search and stays quiet unless
/// `log_if_not_found` is set.
fn try_path(
    style: PathStyle,
    kind: ManifestType,
    path: &Path,
    name: &str,
    caller: &CallerContext,
    log_if_not_found: bool,
) -> Option<NativeManifest> {
    let label = path.display().to_string();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if log_if_not_found {
                error!(
                    "Error reading native manifest file {label}: file is referenced in the registry but does not exist"
                );
            } else {
                debug!(path = %label, "no manifest here");
            }
            return None;
        }
        Err(e) => {
            error!("Error reading native manifest file {label}: {e}");
            return None;
        }
    };
    let data: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            error!("Error parsing native manifest {label}: {e}");
            return None;
        }
    };
    parse_manifest_with(style, kind, &label, name, caller, data)
}

/// Ordered directory search (macOS and Linux).
#[derive(Debug, Clone)]
pub struct PathSearchLocator {
    dirs: Vec<PathBuf>,
    slugs: SlugStyle,
    style: PathStyle,
}

impl PathSearchLocator {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            slugs: SlugStyle::native(),
            style: PathStyle::native(),
        }
    }

    /// User directory first, then the system directories.
    pub fn with_default_dirs() -> Self {
        Self::new(paths::default_search_dirs())
    }

    pub fn with_slugs(mut self, slugs: SlugStyle) -> Self {
        self.slugs = slugs;
        self
    }

    pub fn with_path_style(mut self, style: PathStyle) -> Self {
        self.style = style;
        self
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl ManifestLocator for PathSearchLocator {
    fn lookup(
        &self,
        kind: ManifestType,
        name: &str,
        caller: &CallerContext,
    ) -> Option<ResolvedManifest> {
        if !is_safe_lookup_name(name) {
            warn!(name, "refusing manifest lookup for unsafe name");
            return None;
        }
        for dir in &self.dirs {
            let path = paths::manifest_file(dir, kind, self.slugs, name);
            if let Some(manifest) = try_path(self.style, kind, &path, name, caller, false) {
                return Some(ResolvedManifest { path, manifest });
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryHive {
    CurrentUser,
    LocalMachine,
}

/// WOW64 registry view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryView {
    View32,
    View64,
}

/// The default value of a registry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryValue {
    String(String),
    /// Present but not a string (e.g. `REG_DWORD`).
    Other,
}

/// Read access to the registry, kept behind a trait so the lookup order can be
/// exercised without Windows.
pub trait RegistrySource: Send + Sync {
    fn read_default(&self, hive: RegistryHive, view: RegistryView, key: &str)
        -> Option<RegistryValue>;
}

pub const REGISTRY_SEARCH_ORDER: [(RegistryHive, RegistryView); 3] = [
    (RegistryHive::CurrentUser, RegistryView::View64),
    (RegistryHive::LocalMachine, RegistryView::View32),
    (RegistryHive::LocalMachine, RegistryView::View64),
];

/// Registry-driven lookup (Windows).
pub struct RegistryLocator<S> {
    source: S,
    style: PathStyle,
}

impl<S: RegistrySource> RegistryLocator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            style: PathStyle::native(),
        }
    }

    pub fn with_path_style(mut self, style: PathStyle) -> Self {
        self.style = style;
        self
    }
}

impl<S: RegistrySource> ManifestLocator for RegistryLocator<S> {
    fn lookup(
        &self,
        kind: ManifestType,
        name: &str,
        caller: &CallerContext,
    ) -> Option<ResolvedManifest> {
        if !is_safe_lookup_name(name) {
            warn!(name, "refusing manifest lookup for unsafe name");
            return None;
        }
        let key = paths::registry_key(kind, name);
        let value = REGISTRY_SEARCH_ORDER
            .iter()
            .filter_map(|&(hive, view)| self.source.read_default(hive, view, &key))
            .find(|v| !matches!(v, RegistryValue::String(s) if s.is_empty()))?;

        let mut path = match value {
            RegistryValue::String(s) => s,
            RegistryValue::Other => {
                error!("Native manifest registry entry {key} must be a string path");
                return None;
            }
        };
        if self.style == PathStyle::Windows {
            path = path.replace('/', "\\");
        }
        let path = PathBuf::from(path);
        let manifest = try_path(self.style, kind, &path, name, caller, true)?;
        Some(ResolvedManifest { path, manifest })
    }
}
