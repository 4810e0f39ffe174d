//! The bridge service object.
//!
//! A [`Bridge`] carries the configuration, the manifest locator and the
//! optional broker that every session needs. It is built once and passed to
//! whoever opens connections; there is no process-wide instance.

use crate::broker::Broker;
use crate::config::{BridgeConfig, LocatorKind};
use crate::error::{BridgeError, Result};
use crate::manifest::{
    CallerContext, ManifestLocator, ManifestType, PathSearchLocator, ResolvedManifest,
};
use crate::port::{Disconnect, Port, PortEvent};
use crate::session::{self, SessionParams, SessionTask};
use crate::wire;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct Bridge {
    config: BridgeConfig,
    locator: Arc<dyn ManifestLocator>,
    broker: Option<Arc<dyn Broker>>,
    sessions: Mutex<Vec<SessionTask>>,
}

fn default_locator(config: &BridgeConfig) -> Result<Arc<dyn ManifestLocator>> {
    if config.locator == LocatorKind::Registry && config.manifest_dirs.is_some() {
        return Err(BridgeError::Config(
            "manifest_dirs only applies to the paths locator".into(),
        ));
    }
    match config.locator {
        LocatorKind::Paths => {
            let locator = match &config.manifest_dirs {
                Some(dirs) => PathSearchLocator::new(dirs.clone()),
                None => PathSearchLocator::with_default_dirs(),
            };
            Ok(Arc::new(locator))
        }
        #[cfg(all(windows, feature = "windows-registry"))]
        LocatorKind::Registry => Ok(Arc::new(crate::manifest::RegistryLocator::new(
            crate::manifest::winreg::WinRegistry,
        ))),
        #[cfg(not(all(windows, feature = "windows-registry")))]
        LocatorKind::Registry => Err(BridgeError::Config(
            "registry manifest lookup needs Windows and the `windows-registry` feature".into(),
        )),
    }
}

impl Bridge {
    /// Build a bridge with the locator `config` asks for.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let locator = default_locator(&config)?;
        Ok(Self::with_locator(config, locator))
    }

    /// Defaults plus the `NM_BRIDGE_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::new(BridgeConfig::from_env()?)
    }

    pub fn with_locator(config: BridgeConfig, locator: Arc<dyn ManifestLocator>) -> Self {
        Self {
            config,
            locator,
            broker: None,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Route session startup through `broker` whenever it says it should be used.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Look up and validate a manifest without starting anything.
    pub fn lookup_manifest(
        &self,
        kind: ManifestType,
        name: &str,
        caller: &CallerContext,
    ) -> Option<ResolvedManifest> {
        self.locator.lookup(kind, name, caller)
    }

    /// Serialize `msg` for [`Port::post_message`], enforcing the outbound limit.
    pub fn encode_message<T: Serialize + ?Sized>(&self, msg: &T) -> Result<Vec<u8>> {
        wire::encode_message(msg, self.config.limits.max_write)
    }

    /// Open a session with the native application `name`.
    ///
    /// Returns at once. Lookup and spawn run in the background; a failure there
    /// arrives as a [`Disconnect::Error`] on the port.
    ///
    /// # Panics
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn connect(&self, name: &str, caller: &CallerContext) -> Port {
        let (port, task) = session::open(SessionParams {
            name: name.to_string(),
            caller: caller.clone(),
            config: self.config.clone(),
            locator: self.locator.clone(),
            broker: self.broker.clone(),
        });
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.retain(|s| !s.is_finished());
        sessions.push(task);
        port
    }

    /// Connect, send one message, and return the first reply.
    ///
    /// The session is closed afterwards whatever happened. A helper that exits
    /// without replying yields [`BridgeError::Disconnected`].
    pub async fn send_native_message(
        &self,
        name: &str,
        caller: &CallerContext,
        buffer: Vec<u8>,
    ) -> Result<Value> {
        wire::check_write_len(buffer.len(), self.config.limits.max_write)?;

        let mut port = self.connect(name, caller);
        if let Err(e) = port.post_message(buffer) {
            // Startup already failed; the disconnect below carries the reason.
            debug!(app = name, error = %e, "request was not queued");
        }
        let reply = match port.next_event().await {
            Some(PortEvent::Message(msg)) => Ok(msg),
            Some(PortEvent::Disconnect(Disconnect::Error(e))) => Err(e),
            Some(PortEvent::Disconnect(Disconnect::Clean)) | None => {
                Err(BridgeError::Disconnected)
            }
        };
        port.close();
        reply
    }

    /// Number of sessions whose driver is still running.
    pub fn active_sessions(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.iter().filter(|s| !s.is_finished()).count()
    }

    /// Close every session and wait until each one has been torn down.
    ///
    /// Bounded by the shutdown grace budget: a helper that survives every
    /// stage is left behind.
    pub async fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap_or_else(|p| p.into_inner()));
        for s in &sessions {
            s.close();
        }
        for s in sessions {
            s.join().await;
        }
    }
}
