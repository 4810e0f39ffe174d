//! # native_bridge
//!
//! The **browser side** of Native Messaging: the part that finds a native
//! application, starts it, and exchanges framed JSON with it over its stdio.
//!
//! - Discover and validate **native manifests** (fail-closed, one generic error)
//! - Spawn the helper and run a **framed transport** over its stdin/stdout
//! - Tear the helper down with a **bounded, staged shutdown**
//! - Hand callers a small **port** API: post, receive, disconnect, close
//!
//! ---
//!
//! ## The wire protocol
//!
//! Each message, in both directions, is:
//!
//! 1. a **4-byte length prefix** (`u32`) in **native endianness**;
//! 2. then **that many bytes** of UTF-8 JSON.
//!
//! The bridge writes requests to the helper's **stdin** and reads replies from
//! its **stdout**. Helper **stderr** is forwarded to `tracing` line by line
//! (target `native_bridge::stderr`) and never touches the framing.
//!
//! ### Most important gotchas (read this first)
//!
//! - **Unknown and forbidden look the same:** a missing manifest, a broken
//!   manifest and a caller that is not on the allowlist all end in
//!   [`BridgeError::NoSuchNativeApplication`]. The reason is only logged.
//! - **Message limits:**
//!   - Helper → bridge: **1 MiB** by default ([`wire::MAX_READ`]). A larger
//!     prefix ends the session before the payload is read.
//!   - Bridge → helper: anything a `u32` prefix can express
//!     ([`wire::MAX_WRITE`]). Too-large posts fail synchronously with
//!     [`BridgeError::WriteTooLarge`] and the session stays open.
//!   - Limits can be lowered through [`BridgeConfig`], never raised.
//! - **Clean vs abnormal disconnect:** end of stream exactly on a frame
//!   boundary is clean ([`Disconnect::Clean`]). A truncated frame, a read or
//!   write error, or a startup failure is [`Disconnect::Error`].
//! - **Closing is quiet:** when you close a port yourself you get no
//!   disconnect notification.
//!
//! ---
//!
//! ## Crate layout
//!
//! - [`bridge`]: the [`Bridge`] service object (config, locator, broker).
//! - [`port`]: the caller's end of a session.
//! - [`manifest`]: manifest schema, validation, lookup strategies, installer.
//! - [`wire`]: frame encoding and decoding, sync and async.
//! - [`process`]: helper spawn and the staged shutdown ladder.
//! - [`broker`]: the OS-mediated (portal) startup variant.
//! - [`config`]: limits, grace budget, environment and TOML loading.
//!
//! ---
//!
//! ## Quick start: talk to a helper
//!
//! ```no_run
//! use native_bridge::{Bridge, BridgeConfig, CallerContext, Disconnect, PortEvent};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), native_bridge::BridgeError> {
//!     let bridge = Bridge::new(BridgeConfig::from_env()?)?;
//!     let caller = CallerContext::new("my-addon@example.org");
//!
//!     let mut port = bridge.connect("com.example.echo", &caller);
//!     port.post(&json!({ "ping": 1 }))?;
//!
//!     while let Some(event) = port.next_event().await {
//!         match event {
//!             PortEvent::Message(msg) => println!("reply: {msg}"),
//!             PortEvent::Disconnect(Disconnect::Clean) => break,
//!             PortEvent::Disconnect(Disconnect::Error(e)) => return Err(e),
//!         }
//!     }
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! `connect` returns immediately. Lookup and spawn happen in the background and
//! anything posted meanwhile is queued, then written in order.
//!
//! ## One request, one reply
//!
//! ```no_run
//! use native_bridge::{Bridge, BridgeConfig, CallerContext};
//!
//! # async fn run() -> native_bridge::Result<()> {
//! let bridge = Bridge::new(BridgeConfig::default())?;
//! let request = bridge.encode_message(&serde_json::json!({ "cmd": "version" }))?;
//! let reply = bridge
//!     .send_native_message("com.example.echo", &CallerContext::new("ext@example.org"), request)
//!     .await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```
//!
//! ---
//!
//! ## Pure framing (runnable example)
//!
//! ```rust
//! use native_bridge::wire::{decode_message, encode_message, frame, MAX_READ, MAX_WRITE};
//! use serde_json::json;
//! use std::io::Cursor;
//!
//! let msg = json!({"hello": "world", "n": 42});
//! let payload = encode_message(&msg, MAX_WRITE).unwrap();
//!
//! let mut cur = Cursor::new(frame(&payload).unwrap());
//! assert_eq!(decode_message(&mut cur, MAX_READ).unwrap(), msg);
//! ```
//!
//! ---
//!
//! ## Manifests
//!
//! A stdio manifest names the helper, says where it lives and who may use it:
//!
//! ```json
//! {
//!   "name": "com.example.echo",
//!   "description": "Echo helper",
//!   "type": "stdio",
//!   "path": "/usr/local/bin/echo-helper",
//!   "allowed_extensions": ["my-addon@example.org"]
//! }
//! ```
//!
//! It is looked up as `<dir>/<slug>/<name>.json` in the user directory first,
//! then the system ones (see [`manifest::paths`]), or through the registry on
//! Windows. The helper is started with two arguments, the manifest path and
//! the caller id, in the directory that contains it.
//!
//! ```
//! use native_bridge::{parse_manifest, CallerContext, ManifestType};
//! use serde_json::json;
//!
//! let data = json!({
//!     "name": "com.example.echo",
//!     "description": "Echo helper",
//!     "type": "stdio",
//!     "path": "/usr/local/bin/echo-helper",
//!     "allowed_extensions": ["my-addon@example.org"]
//! });
//! let ok = CallerContext::new("my-addon@example.org");
//! let other = CallerContext::new("someone-else@example.org");
//! let path = "/tmp/com.example.echo.json";
//!
//! assert!(parse_manifest(ManifestType::Stdio, path, "com.example.echo", &ok, data.clone()).is_some());
//! assert!(parse_manifest(ManifestType::Stdio, path, "com.example.echo", &other, data).is_none());
//! ```
//!
//! ---
//!
//! ## Troubleshooting
//!
//! ### "No such native application"
//! The reason is in the `native_bridge` log output, usually one of:
//! - the manifest is not at `<dir>/native-messaging-hosts/<name>.json`
//!   (`NativeMessagingHosts` on macOS);
//! - its `name` differs from the requested one;
//! - the caller id is not in `allowed_extensions`;
//! - `path` is relative on macOS/Linux.
//!
//! ### The helper never goes away
//! The bridge closes stdin, then signals, then kills, waiting
//! [`BridgeConfig::shutdown_grace`] between steps. A helper that survives all
//! three is left running and the session completes anyway.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod manifest;
pub mod port;
pub mod process;
mod session;
pub mod wire;

#[doc(inline)]
pub use bridge::Bridge;
#[doc(inline)]
pub use config::{BridgeConfig, Limits, LocatorKind};
#[doc(inline)]
pub use error::{BridgeError, Result};
#[doc(inline)]
pub use manifest::{
    parse_manifest, CallerContext, ManifestLocator, ManifestType, NativeManifest,
    PathSearchLocator, ResolvedManifest, Scope, SlugStyle,
};
#[doc(inline)]
pub use port::{Disconnect, Port, PortEvent, PortSender};
#[doc(inline)]
pub use wire::encode_message;

#[cfg(feature = "install")]
#[doc(inline)]
pub use manifest::install::{install_manifest, remove_manifest, verify_installed};
