//! Bridge configuration: message size limits, shutdown grace budget and
//! manifest discovery strategy.
//!
//! Values come from defaults, then an optional TOML file, then environment
//! variables. Size limits can only be lowered; anything above the protocol
//! defaults is clamped.

use crate::error::{BridgeError, Result};
use crate::wire::{MAX_READ, MAX_WRITE};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

pub const ENV_MAX_INPUT: &str = "NM_BRIDGE_MAX_INPUT_BYTES";
pub const ENV_MAX_OUTPUT: &str = "NM_BRIDGE_MAX_OUTPUT_BYTES";
pub const ENV_SHUTDOWN_GRACE: &str = "NM_BRIDGE_SHUTDOWN_GRACE_MS";
pub const ENV_MANIFEST_DIRS: &str = "NM_BRIDGE_MANIFEST_DIRS";

/// How long each shutdown stage waits before escalating.
pub const GRACEFUL_SHUTDOWN_TIME: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest inbound frame accepted from a helper.
    pub max_read: u32,
    /// Largest outbound payload accepted from a caller.
    pub max_write: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_read: MAX_READ,
            max_write: MAX_WRITE,
        }
    }
}

impl Limits {
    pub fn set_max_read(&mut self, bytes: u64) {
        if bytes > u64::from(MAX_READ) {
            warn!(bytes, limit = MAX_READ, "max input size can only be lowered, clamping");
            self.max_read = MAX_READ;
        } else {
            self.max_read = bytes as u32;
        }
    }

    pub fn set_max_write(&mut self, bytes: u64) {
        if bytes > MAX_WRITE {
            warn!(bytes, limit = MAX_WRITE, "max output size can only be lowered, clamping");
            self.max_write = MAX_WRITE;
        } else {
            self.max_write = bytes;
        }
    }
}

/// Which manifest discovery strategy the bridge uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorKind {
    /// Search well-known directories for `<slug>/<name>.json`.
    Paths,
    /// Read the manifest location from the Windows registry.
    Registry,
}

impl LocatorKind {
    /// The registry on Windows builds that can read it, directory search
    /// everywhere else.
    pub fn native() -> Self {
        if cfg!(all(windows, feature = "windows-registry")) {
            LocatorKind::Registry
        } else {
            LocatorKind::Paths
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub limits: Limits,
    pub shutdown_grace: Duration,
    pub locator: LocatorKind,
    /// Replaces the built-in user/system search directories when set.
    pub manifest_dirs: Option<Vec<PathBuf>>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            shutdown_grace: GRACEFUL_SHUTDOWN_TIME,
            locator: LocatorKind::native(),
            manifest_dirs: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    max_input_message_bytes: Option<u64>,
    max_output_message_bytes: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    locator: Option<LocatorKind>,
    manifest_dirs: Option<Vec<PathBuf>>,
}

impl BridgeConfig {
    /// Parse a TOML document on top of the defaults.
    ///
    /// ```
    /// use native_bridge::config::BridgeConfig;
    ///
    /// let cfg = BridgeConfig::from_toml_str("max_input_message_bytes = 4096").unwrap();
    /// assert_eq!(cfg.limits.max_read, 4096);
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(s).map_err(|e| BridgeError::Config(e.to_string()))?;
        let mut cfg = Self::default();
        cfg.apply(raw);
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by the `NM_BRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| env::var_os(key))
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<std::ffi::OsString>,
    {
        let number = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                None => Ok(None),
                Some(v) => {
                    let s = v.to_string_lossy();
                    s.trim().parse::<u64>().map(Some).map_err(|_| {
                        BridgeError::Config(format!("{key} must be an unsigned integer, got {s:?}"))
                    })
                }
            }
        };

        if let Some(n) = number(ENV_MAX_INPUT)? {
            self.limits.set_max_read(n);
        }
        if let Some(n) = number(ENV_MAX_OUTPUT)? {
            self.limits.set_max_write(n);
        }
        if let Some(ms) = number(ENV_SHUTDOWN_GRACE)? {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(dirs) = lookup(ENV_MANIFEST_DIRS) {
            let dirs: Vec<PathBuf> = env::split_paths(&dirs).filter(|p| !p.as_os_str().is_empty()).collect();
            if !dirs.is_empty() {
                self.manifest_dirs = Some(dirs);
            }
        }
        Ok(())
    }

    fn apply(&mut self, raw: RawConfig) {
        if let Some(n) = raw.max_input_message_bytes {
            self.limits.set_max_read(n);
        }
        if let Some(n) = raw.max_output_message_bytes {
            self.limits.set_max_write(n);
        }
        if let Some(ms) = raw.shutdown_grace_ms {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(kind) = raw.locator {
            self.locator = kind;
        }
        if raw.manifest_dirs.is_some() {
            self.manifest_dirs = raw.manifest_dirs;
        }
    }
}
