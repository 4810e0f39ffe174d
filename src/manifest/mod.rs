//! Native manifests: the JSON descriptors that name and locate a helper
//! application and say which callers may use it.
//!
//! Validation is fail-closed and never throws: every rejection is logged and
//! reported as `None`, and the session turns that into one generic
//! "No such native application" error.

#[cfg(feature = "install")]
pub mod install;
pub mod locator;
pub mod paths;

#[cfg(all(windows, feature = "windows-registry"))]
pub mod winreg;

pub use locator::{
    ManifestLocator, PathSearchLocator, RegistryHive, RegistryLocator, RegistrySource,
    RegistryValue, RegistryView, REGISTRY_SEARCH_ORDER,
};
pub use paths::{Scope, SlugStyle};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, path::PathBuf};
use tracing::error;

/// The three manifest kinds a browser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestType {
    Stdio,
    Storage,
    Pkcs11,
}

impl ManifestType {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifestType::Stdio => "stdio",
            ManifestType::Storage => "storage",
            ManifestType::Pkcs11 => "pkcs11",
        }
    }

    /// Directory (or registry key) name for this type.
    pub fn slug(self, style: SlugStyle) -> &'static str {
        match (self, style) {
            (ManifestType::Stdio, SlugStyle::Dashed) => "native-messaging-hosts",
            (ManifestType::Storage, SlugStyle::Dashed) => "managed-storage",
            (ManifestType::Pkcs11, SlugStyle::Dashed) => "pkcs11-modules",
            (ManifestType::Stdio, SlugStyle::CamelCase) => "NativeMessagingHosts",
            (ManifestType::Storage, SlugStyle::CamelCase) => "ManagedStorage",
            (ManifestType::Pkcs11, SlugStyle::CamelCase) => "PKCS11Modules",
        }
    }
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ManifestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(ManifestType::Stdio),
            "storage" => Ok(ManifestType::Storage),
            "pkcs11" => Ok(ManifestType::Pkcs11),
            other => Err(format!("unknown manifest type {other:?}")),
        }
    }
}

/// Represents a native manifest as found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: ManifestType,
    /// Executable (stdio) or module (pkcs11) path, exactly as written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_extensions: Option<Vec<String>>,
    /// Managed storage payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

/// Identity of whoever asks for a native application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerContext {
    pub extension_id: String,
}

impl CallerContext {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
        }
    }
}

/// A manifest that passed validation, with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedManifest {
    pub path: PathBuf,
    pub manifest: NativeManifest,
}

/// Path conventions used when judging and resolving manifest paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Posix,
    Windows,
}

impl PathStyle {
    pub fn native() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Posix
        }
    }

    pub fn is_absolute(self, path: &str) -> bool {
        match self {
            PathStyle::Posix => path.starts_with('/'),
            PathStyle::Windows => {
                let b = path.as_bytes();
                path.starts_with(r"\\")
                    || (b.len() >= 3
                        && b[0].is_ascii_alphabetic()
                        && b[1] == b':'
                        && (b[2] == b'\\' || b[2] == b'/'))
            }
        }
    }
}

/// `^\w+(\.\w+)*$`, the name pattern for stdio and pkcs11 manifests.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
}

/// Names are joined onto directories and registry keys, so anything that could
/// leave the type directory is refused before any lookup happens.
pub(crate) fn is_safe_lookup_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

/// Validate `data` as a manifest of `kind` named `name` on behalf of `caller`.
///
/// `path` only labels log lines. Returns `None` after logging on any failure.
pub fn parse_manifest(
    kind: ManifestType,
    path: &str,
    name: &str,
    caller: &CallerContext,
    data: Value,
) -> Option<NativeManifest> {
    parse_manifest_with(PathStyle::native(), kind, path, name, caller, data)
}

pub fn parse_manifest_with(
    style: PathStyle,
    kind: ManifestType,
    path: &str,
    name: &str,
    caller: &CallerContext,
    data: Value,
) -> Option<NativeManifest> {
    let manifest: NativeManifest = match serde_json::from_value(data) {
        Ok(m) => m,
        Err(e) => {
            error!(path, "Native manifest {path} is invalid: {e}");
            return None;
        }
    };
    if let Err(reason) = check_schema(&manifest) {
        error!(path, "Native manifest {path} is invalid: {reason}");
        return None;
    }

    if manifest.kind != kind {
        error!(
            path,
            "Native manifest {path} has type property {} (expected {kind})", manifest.kind
        );
        return None;
    }
    if manifest.name != name {
        error!(
            path,
            "Native manifest {path} has name property {} (expected {name})", manifest.name
        );
        return None;
    }
    if kind == ManifestType::Stdio && style == PathStyle::Posix {
        // pkcs11 modules may be relative; stdio hosts may not (outside Windows).
        let exe = manifest.path.as_deref().unwrap_or_default();
        if !style.is_absolute(exe) {
            error!(
                path,
                "Native manifest {path} has relative path value {exe} (expected absolute path)"
            );
            return None;
        }
    }
    if let Some(allowed) = &manifest.allowed_extensions {
        if !allowed.iter().any(|id| *id == caller.extension_id) {
            error!(
                path,
                "This extension does not have permission to use native manifest {path}"
            );
            return None;
        }
    }

    Some(manifest)
}

fn check_schema(m: &NativeManifest) -> Result<(), String> {
    match m.kind {
        ManifestType::Stdio | ManifestType::Pkcs11 => {
            if !is_valid_name(&m.name) {
                return Err(format!("name {:?} must match ^\\w+(\\.\\w+)*$", m.name));
            }
            match m.path.as_deref() {
                Some(p) if !p.is_empty() => {}
                _ => return Err("missing path".to_string()),
            }
        }
        ManifestType::Storage => {
            if m.name.is_empty() {
                return Err("empty name".to_string());
            }
        }
    }
    if matches!(&m.allowed_extensions, Some(list) if list.is_empty()) {
        return Err("allowed_extensions must not be empty".to_string());
    }
    Ok(())
}

/// Turn the manifest's `path` into the command to run.
///
/// On Windows, `/` is normalized to `\` and a relative command is resolved
/// against the directory holding the manifest (`..` is allowed).
pub fn resolve_command(style: PathStyle, manifest_file: &str, command: &str) -> PathBuf {
    match style {
        PathStyle::Posix => PathBuf::from(command),
        PathStyle::Windows => {
            let command = command.replace('/', "\\");
            if style.is_absolute(&command) {
                return PathBuf::from(command);
            }
            let manifest_file = manifest_file.replace('/', "\\");
            let parent = manifest_file
                .rsplit_once('\\')
                .map(|(dir, _)| dir)
                .unwrap_or(".");
            PathBuf::from(format!("{parent}\\{command}"))
        }
    }
}
