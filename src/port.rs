//! The caller's end of a session.
//!
//! Inbound messages arrive on a channel in frame order. The end of the session
//! is reported once, through a separate single-shot signal, and only when the
//! caller did not close the port itself.

use crate::error::{BridgeError, Result};
use crate::session::{CleanupCause, Shared};
use crate::wire;
use serde::Serialize;
use serde_json::Value;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::{mpsc, oneshot};

/// How a session ended, from the caller's point of view.
#[derive(Debug)]
pub enum Disconnect {
    /// The helper closed its stdout.
    Clean,
    /// Startup failed or the transport broke.
    Error(BridgeError),
}

impl Disconnect {
    pub fn error(&self) -> Option<&BridgeError> {
        match self {
            Disconnect::Clean => None,
            Disconnect::Error(e) => Some(e),
        }
    }

    pub fn into_error(self) -> Option<BridgeError> {
        match self {
            Disconnect::Clean => None,
            Disconnect::Error(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum PortEvent {
    Message(Value),
    Disconnect(Disconnect),
}

/// Closes the session once every handle onto it is gone.
struct CloseGuard(Arc<Shared>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.begin_cleanup(CleanupCause::Caller);
    }
}

/// Cloneable sending half.
#[derive(Clone)]
pub struct PortSender {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    max_write: u64,
    _guard: Arc<CloseGuard>,
}

impl PortSender {
    /// Queue an already encoded payload (UTF-8 JSON, no length prefix).
    ///
    /// Never blocks. Size violations are reported here, synchronously, and
    /// leave the session untouched.
    pub fn post_message(&self, buffer: Vec<u8>) -> Result<()> {
        if self.shared.is_cleaning_up() {
            return Err(BridgeError::Disconnected);
        }
        wire::check_write_len(buffer.len(), self.max_write)?;
        self.outbound
            .send(buffer)
            .map_err(|_| BridgeError::Disconnected)
    }

    /// Serialize `msg` and queue it.
    pub fn post<T: Serialize + ?Sized>(&self, msg: &T) -> Result<()> {
        let buffer = wire::encode_message(msg, self.max_write)?;
        self.post_message(buffer)
    }

    /// Close the session from the caller's side. No disconnect notification
    /// follows.
    pub fn close(&self) {
        self.shared.begin_cleanup(CleanupCause::Caller);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_cleaning_up()
    }
}

/// Inbound messages, in the order their frames were read.
pub struct PortMessages {
    rx: mpsc::UnboundedReceiver<Value>,
    _guard: Arc<CloseGuard>,
}

impl PortMessages {
    /// `None` once the reader has stopped and every queued message was taken.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Resolves once with the session's disconnect, or `None` if the caller closed
/// the session (nobody needs to be told).
pub struct DisconnectSignal {
    rx: oneshot::Receiver<Disconnect>,
    _guard: Arc<CloseGuard>,
}

impl Future for DisconnectSignal {
    type Output = Option<Disconnect>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// A live connection to a native application.
///
/// Dropping every part of a port closes the session like [`Port::close`].
pub struct Port {
    name: String,
    sender: PortSender,
    messages: PortMessages,
    disconnect: Option<DisconnectSignal>,
}

impl Port {
    pub(crate) fn new(
        shared: Arc<Shared>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Value>,
        disconnect: oneshot::Receiver<Disconnect>,
        max_write: u64,
    ) -> Self {
        let guard = Arc::new(CloseGuard(shared.clone()));
        Self {
            name: shared.name().to_string(),
            sender: PortSender {
                shared,
                outbound,
                max_write,
                _guard: guard.clone(),
            },
            messages: PortMessages {
                rx: inbound,
                _guard: guard.clone(),
            },
            disconnect: Some(DisconnectSignal {
                rx: disconnect,
                _guard: guard,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post_message(&self, buffer: Vec<u8>) -> Result<()> {
        self.sender.post_message(buffer)
    }

    pub fn post<T: Serialize + ?Sized>(&self, msg: &T) -> Result<()> {
        self.sender.post(msg)
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.messages.recv().await
    }

    /// Next message, then the disconnect once the messages run out.
    ///
    /// `None` means the session ended without a notification: the caller
    /// closed it, or the disconnect was already returned.
    pub async fn next_event(&mut self) -> Option<PortEvent> {
        if let Some(msg) = self.messages.recv().await {
            return Some(PortEvent::Message(msg));
        }
        let signal = self.disconnect.take()?;
        signal.await.map(PortEvent::Disconnect)
    }

    /// Wait for the end of the session, skipping any messages still queued.
    pub async fn disconnected(&mut self) -> Option<Disconnect> {
        self.disconnect.take()?.await
    }

    pub fn close(self) {
        self.sender.close();
    }

    /// Take the three halves apart. The session stays open until all of them
    /// are dropped or one of them closes it.
    pub fn split(self) -> (PortSender, PortMessages, Option<DisconnectSignal>) {
        (self.sender, self.messages, self.disconnect)
    }
}
