use super::locator::{RegistryHive, RegistrySource, RegistryValue, RegistryView};
use super::{paths, ManifestType};
use std::{io, path::Path};
use tracing::debug;
use winreg::{
    enums::{
        RegType, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WOW64_32KEY,
        KEY_WOW64_64KEY,
    },
    RegKey,
};

/// The real Windows registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinRegistry;

impl RegistrySource for WinRegistry {
    fn read_default(
        &self,
        hive: RegistryHive,
        view: RegistryView,
        key: &str,
    ) -> Option<RegistryValue> {
        let root = RegKey::predef(match hive {
            RegistryHive::CurrentUser => HKEY_CURRENT_USER,
            RegistryHive::LocalMachine => HKEY_LOCAL_MACHINE,
        });
        let flags = KEY_READ
            | match view {
                RegistryView::View32 => KEY_WOW64_32KEY,
                RegistryView::View64 => KEY_WOW64_64KEY,
            };
        let subkey = match root.open_subkey_with_flags(key, flags) {
            Ok(k) => k,
            Err(e) => {
                debug!(?hive, ?view, key, error = %e, "registry key not readable");
                return None;
            }
        };
        let raw = subkey.get_raw_value("").ok()?;
        match raw.vtype {
            RegType::REG_SZ | RegType::REG_EXPAND_SZ => {
                subkey.get_value::<String, _>("").ok().map(RegistryValue::String)
            }
            _ => Some(RegistryValue::Other),
        }
    }
}

/// Point the HKCU entry for `(kind, name)` at `manifest_path`.
pub fn register_manifest(kind: ManifestType, name: &str, manifest_path: &Path) -> io::Result<()> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let (key, _) = hkcu.create_subkey(paths::registry_key(kind, name))?;
    let value = manifest_path.to_string_lossy().into_owned();
    key.set_value("", &value)?;
    Ok(())
}

/// Remove the HKCU entry for `(kind, name)`. Missing keys are not an error.
pub fn unregister_manifest(kind: ManifestType, name: &str) -> io::Result<()> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    match hkcu.delete_subkey(paths::registry_key(kind, name)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
