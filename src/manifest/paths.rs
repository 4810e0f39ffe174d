//! Where manifests live: type slugs, per-OS search roots and registry keys.
//!
//! The roots come from the embedded `locations.toml`.

use super::ManifestType;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How type directories are spelled on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlugStyle {
    /// `native-messaging-hosts` (Linux).
    Dashed,
    /// `NativeMessagingHosts` (macOS, Windows registry).
    CamelCase,
}

impl SlugStyle {
    pub fn native() -> Self {
        current_os().map(|os| os.slugs).unwrap_or(SlugStyle::Dashed)
    }
}

/// User-level or system-level manifest root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    User,
    System,
}

#[derive(Debug, Deserialize)]
struct Locations {
    registry_root: String,
    linux: OsLocations,
    macos: OsLocations,
    windows: OsLocations,
}

#[derive(Debug, Deserialize)]
struct OsLocations {
    slugs: SlugStyle,
    user: String,
    system: Vec<String>,
}

static LOCATIONS: Lazy<Locations> = Lazy::new(|| {
    toml::from_str(include_str!("locations.toml")).expect("embedded locations.toml is valid")
});

fn current_os() -> Option<&'static OsLocations> {
    if cfg!(target_os = "linux") {
        Some(&LOCATIONS.linux)
    } else if cfg!(target_os = "macos") {
        Some(&LOCATIONS.macos)
    } else if cfg!(windows) {
        Some(&LOCATIONS.windows)
    } else {
        None
    }
}

/// Expand a leading `$VAR` from the environment.
fn expand(template: &str) -> Option<PathBuf> {
    let Some(rest) = template.strip_prefix('$') else {
        return Some(PathBuf::from(template));
    };
    let (var, tail) = match rest.find(['/', '\\']) {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, ""),
    };
    match std::env::var_os(var) {
        Some(base) if !base.is_empty() => {
            let base = PathBuf::from(base);
            Some(if tail.is_empty() { base } else { base.join(tail) })
        }
        _ => {
            debug!(var, "manifest root skipped, variable not set");
            None
        }
    }
}

/// Root directory for `scope` on this OS.
pub fn scope_roots(scope: Scope) -> Vec<PathBuf> {
    let Some(os) = current_os() else {
        return Vec::new();
    };
    match scope {
        Scope::User => expand(&os.user).into_iter().collect(),
        Scope::System => os.system.iter().filter_map(|t| expand(t)).collect(),
    }
}

/// Search order used by the path locator: user roots, then system roots.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = scope_roots(Scope::User);
    dirs.extend(scope_roots(Scope::System));
    dirs
}

/// `<root>/<slug>/<name>.json`
pub fn manifest_file(root: &Path, kind: ManifestType, slugs: SlugStyle, name: &str) -> PathBuf {
    root.join(kind.slug(slugs)).join(format!("{name}.json"))
}

/// `Software\Mozilla\<Slug>\<name>`
pub fn registry_key(kind: ManifestType, name: &str) -> String {
    format!(
        r"{}\{}\{name}",
        LOCATIONS.registry_root,
        kind.slug(SlugStyle::CamelCase)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_locations_parse() {
        assert_eq!(LOCATIONS.registry_root, r"Software\Mozilla");
        assert_eq!(LOCATIONS.linux.slugs, SlugStyle::Dashed);
        assert_eq!(LOCATIONS.macos.slugs, SlugStyle::CamelCase);
    }

    #[test]
    fn registry_key_uses_camel_case_slug() {
        assert_eq!(
            registry_key(ManifestType::Stdio, "com.example.echo"),
            r"Software\Mozilla\NativeMessagingHosts\com.example.echo"
        );
        assert_eq!(
            registry_key(ManifestType::Pkcs11, "token"),
            r"Software\Mozilla\PKCS11Modules\token"
        );
    }

    #[test]
    fn manifest_file_layout() {
        let p = manifest_file(
            Path::new("/home/u/.mozilla"),
            ManifestType::Storage,
            SlugStyle::Dashed,
            "addon@example.org",
        );
        assert_eq!(
            p,
            PathBuf::from("/home/u/.mozilla/managed-storage/addon@example.org.json")
        );
    }

    #[test]
    fn literal_roots_are_not_expanded() {
        assert_eq!(expand("/usr/lib/mozilla"), Some(PathBuf::from("/usr/lib/mozilla")));
        assert_eq!(expand("$NM_BRIDGE_SURELY_UNSET_VAR/x"), None);
    }
}
