//! OS-mediated helper startup.
//!
//! Some sandboxes do not let the browser spawn processes. A broker (for
//! example an XDG desktop portal) can look up the manifest, start the helper
//! and hand back its pipes instead. The broker owns that process; the bridge
//! only closes the broker session on teardown.

use crate::error::{BridgeError, Result};
use crate::manifest::{parse_manifest, CallerContext, ManifestType};
use crate::process::Pipes;
use std::{future::Future, io, pin::Pin, sync::Arc};
use tracing::{error, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque broker session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerSession(pub String);

pub trait Broker: Send + Sync {
    /// Whether sessions should go through this broker at all.
    fn should_use(&self) -> bool {
        true
    }

    fn available(&self) -> BoxFuture<'_, bool>;

    fn create_session<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<BrokerSession>>;

    /// Raw manifest JSON for `name`, as the broker sees it.
    fn get_manifest<'a>(
        &'a self,
        session: &'a BrokerSession,
        name: &'a str,
        caller: &'a str,
    ) -> BoxFuture<'a, io::Result<String>>;

    /// Start the helper. `NotFound` means the broker knows no such application.
    fn start<'a>(
        &'a self,
        session: &'a BrokerSession,
        name: &'a str,
        caller: &'a str,
    ) -> BoxFuture<'a, io::Result<Pipes>>;

    fn close_session<'a>(&'a self, session: &'a BrokerSession) -> BoxFuture<'a, io::Result<()>>;
}

/// A helper owned by a broker session.
pub struct BrokeredProcess {
    broker: Arc<dyn Broker>,
    session: BrokerSession,
}

impl BrokeredProcess {
    /// Close the broker session. Failures are logged; teardown always completes.
    pub async fn close(self) {
        if let Err(e) = self.broker.close_session(&self.session).await {
            warn!(session = %self.session.0, error = %e, "closing broker session failed");
        }
    }
}

fn label(raw: &str) -> String {
    let head: String = raw.chars().take(30).collect();
    format!("{head}...")
}

/// Start `name` through `broker`.
///
/// Every "this application does not exist for you" answer from the broker
/// becomes the generic [`BridgeError::NoSuchNativeApplication`]. If startup
/// fails after a session was created, that session is closed before returning.
pub(crate) async fn start_brokered(
    broker: Arc<dyn Broker>,
    name: &str,
    caller: &CallerContext,
) -> Result<(BrokeredProcess, Pipes)> {
    let generic = || BridgeError::NoSuchNativeApplication(name.to_string());

    if !broker.available().await {
        error!("Native messaging portal is not available");
        return Err(generic());
    }
    let session = broker
        .create_session(name)
        .await
        .map_err(|e| BridgeError::Broker(e.to_string()))?;
    let process = BrokeredProcess {
        broker: broker.clone(),
        session,
    };

    match start_in_session(&*broker, &process.session, name, caller).await {
        Ok(pipes) => Ok((process, pipes)),
        Err(e) => {
            process.close().await;
            Err(e)
        }
    }
}

async fn start_in_session(
    broker: &dyn Broker,
    session: &BrokerSession,
    name: &str,
    caller: &CallerContext,
) -> Result<Pipes> {
    let generic = || BridgeError::NoSuchNativeApplication(name.to_string());

    let raw = match broker.get_manifest(session, name, &caller.extension_id).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(app = name, error = %e, "broker could not provide a manifest");
            return Err(generic());
        }
    };
    let path = label(&raw);
    let data = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            error!("Error parsing native manifest {path}: {e}");
            return Err(generic());
        }
    };
    if parse_manifest(ManifestType::Stdio, &path, name, caller, data).is_none() {
        return Err(generic());
    }

    match broker.start(session, name, &caller.extension_id).await {
        Ok(pipes) => Ok(pipes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(generic()),
        Err(e) => Err(BridgeError::Broker(e.to_string())),
    }
}
