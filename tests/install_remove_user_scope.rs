#![cfg(feature = "install")]

mod common;

use common::CALLER;
use native_bridge::manifest::paths;
use native_bridge::{
    install_manifest, remove_manifest, verify_installed, CallerContext, ManifestLocator,
    ManifestType, NativeManifest, PathSearchLocator, Scope,
};
use serial_test::serial;
use std::path::PathBuf;

fn dummy_exe_path() -> PathBuf {
    // On Unix, manifest path must be absolute. We'll use a stable absolute placeholder.
    #[cfg(unix)]
    {
        PathBuf::from("/usr/bin/true")
    }

    #[cfg(windows)]
    {
        PathBuf::from(r"C:\Windows\System32\cmd.exe")
    }
}

fn manifest(name: &str) -> NativeManifest {
    NativeManifest {
        name: name.to_string(),
        description: Some("test host".to_string()),
        kind: ManifestType::Stdio,
        path: Some(dummy_exe_path().to_string_lossy().into_owned()),
        allowed_extensions: Some(vec![CALLER.to_string()]),
        data: None,
    }
}

#[test]
#[serial]
fn install_then_remove_user_scope() {
    let (_td, _env) = common::sandbox_env();
    let host = "com.example.installremove";

    let file = install_manifest(&manifest(host), Scope::User).unwrap();
    assert!(file.exists(), "manifest should exist: {file:?}");

    let raw = std::fs::read_to_string(&file).unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(v.get("name").and_then(|x| x.as_str()), Some(host));
    assert_eq!(v.get("type").and_then(|x| x.as_str()), Some("stdio"));
    assert!(v.get("data").is_none(), "unset fields are not written");

    assert!(verify_installed(ManifestType::Stdio, host, Scope::User).unwrap());
    assert!(!verify_installed(ManifestType::Pkcs11, host, Scope::User).unwrap());

    assert!(remove_manifest(ManifestType::Stdio, host, Scope::User).unwrap());
    assert!(!verify_installed(ManifestType::Stdio, host, Scope::User).unwrap());
    assert!(!file.exists(), "manifest should be removed: {file:?}");

    // Removing twice is not an error.
    assert!(!remove_manifest(ManifestType::Stdio, host, Scope::User).unwrap());
}

#[test]
#[serial]
fn installed_manifest_is_found_by_the_path_locator() {
    let (_td, _env) = common::sandbox_env();
    let host = "com.example.roundtrip";

    let file = install_manifest(&manifest(host), Scope::User).unwrap();
    let locator = PathSearchLocator::new(paths::scope_roots(Scope::User));
    let found = locator
        .lookup(ManifestType::Stdio, host, &CallerContext::new(CALLER))
        .expect("installed manifest should resolve");
    assert_eq!(found.path, file);
    assert_eq!(found.manifest, manifest(host));
}

#[test]
#[serial]
fn invalid_names_are_refused() {
    let (_td, _env) = common::sandbox_env();

    assert!(install_manifest(&manifest("not a/valid name"), Scope::User).is_err());
    assert!(install_manifest(&manifest("trailing."), Scope::User).is_err());
    assert!(remove_manifest(ManifestType::Stdio, "../x", Scope::User).is_err());
    assert!(!verify_installed(ManifestType::Stdio, "../x", Scope::User).unwrap());
}

#[cfg(unix)]
#[test]
#[serial]
fn relative_stdio_path_is_refused_on_unix() {
    let (_td, _env) = common::sandbox_env();

    let mut m = manifest("com.example.relative");
    m.path = Some("bin/host".to_string());
    assert!(install_manifest(&m, Scope::User).is_err());
    assert!(!verify_installed(ManifestType::Stdio, "com.example.relative", Scope::User).unwrap());
}

#[test]
#[serial]
fn manifest_type_field_picks_the_install_directory() {
    let (td, _env) = common::sandbox_env();
    let name = "com.example.policy";

    // The same steps `nmbridge install` takes: read the file, install what it says.
    let source = td.path().join("policy.json");
    std::fs::write(
        &source,
        serde_json::json!({
            "name": name,
            "type": "storage",
            "data": { "homepage": "https://example.org" },
        })
        .to_string(),
    )
    .unwrap();
    let parsed: NativeManifest =
        serde_json::from_str(&std::fs::read_to_string(&source).unwrap()).unwrap();

    let file = install_manifest(&parsed, Scope::User).unwrap();
    assert!(verify_installed(ManifestType::Storage, name, Scope::User).unwrap());
    assert!(!verify_installed(ManifestType::Stdio, name, Scope::User).unwrap());

    let found = PathSearchLocator::new(paths::scope_roots(Scope::User))
        .lookup(ManifestType::Storage, name, &CallerContext::new(CALLER))
        .expect("storage manifest should resolve");
    assert_eq!(found.path, file);
    assert_eq!(found.manifest.kind, ManifestType::Storage);

    assert!(remove_manifest(ManifestType::Storage, name, Scope::User).unwrap());
}
