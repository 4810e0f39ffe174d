#![allow(dead_code)]

use native_bridge::manifest::paths;
use native_bridge::{ManifestType, SlugStyle};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// Env guard that restores previous env vars on drop.
pub struct EnvGuard {
    old: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn set(vars: &[(&str, String)]) -> Self {
        let mut old = HashMap::new();
        for (k, v) in vars {
            old.insert((*k).to_string(), env::var(k).ok());
            env::set_var(k, v);
        }
        Self { old }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (k, prev) in self.old.drain() {
            match prev {
                Some(v) => env::set_var(k, v),
                None => env::remove_var(k),
            }
        }
    }
}

/// Create a temp sandbox and point the user manifest roots into it.
///
/// - Linux/macOS: HOME
/// - Windows: APPDATA and PROGRAMDATA
pub fn sandbox_env() -> (TempDir, EnvGuard) {
    let td = TempDir::new().expect("tempdir");
    let root = td.path().to_path_buf();

    let home = root.join("home");
    let appdata = root.join("appdata_roaming");
    let localappdata = root.join("appdata_local");
    let programdata = root.join("programdata");

    fs::create_dir_all(&home).unwrap();
    fs::create_dir_all(&appdata).unwrap();
    fs::create_dir_all(&localappdata).unwrap();
    fs::create_dir_all(&programdata).unwrap();

    let guard = EnvGuard::set(&[
        ("HOME", home.to_string_lossy().to_string()),
        ("APPDATA", appdata.to_string_lossy().to_string()),
        ("LOCALAPPDATA", localappdata.to_string_lossy().to_string()),
        ("PROGRAMDATA", programdata.to_string_lossy().to_string()),
    ]);

    (td, guard)
}

pub const CALLER: &str = "ext-id-1@example.org";

pub fn stdio_manifest(name: &str, exe: &Path, allowed: &[&str]) -> Value {
    json!({
        "name": name,
        "description": "test helper",
        "type": "stdio",
        "path": exe.to_string_lossy(),
        "allowed_extensions": allowed,
    })
}

/// Write `data` as the `kind` manifest for `name` under `root`.
pub fn write_manifest(root: &Path, kind: ManifestType, name: &str, data: &Value) -> PathBuf {
    let file = paths::manifest_file(root, kind, SlugStyle::native(), name);
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(&file, serde_json::to_vec_pretty(data).unwrap()).unwrap();
    file
}

/// Write an executable `/bin/sh` script named `name` into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// A helper script plus a manifest allowing [`CALLER`], both inside `root`.
#[cfg(unix)]
pub fn install_script_helper(root: &Path, name: &str, body: &str) -> PathBuf {
    let bin = root.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let exe = write_script(&bin, &format!("{name}.sh"), body);
    write_manifest(
        root,
        ManifestType::Stdio,
        name,
        &stdio_manifest(name, &exe, &[CALLER]),
    );
    exe
}
