//! nmbridge - native messaging bridge developer tool
//!
//! Looks up manifests, talks to native applications the way a browser would,
//! and installs manifests for local testing. Logs go to stderr; stdout only
//! carries results.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use native_bridge::{
    install_manifest, Bridge, BridgeConfig, CallerContext, Disconnect, ManifestType,
    NativeManifest, PortEvent, Scope,
};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// nmbridge - native messaging bridge developer tool
#[derive(Parser, Debug)]
#[command(name = "nmbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (environment variables still apply on top)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve and validate a manifest, then print it
    Lookup {
        /// Application name
        name: String,

        /// Caller identity checked against `allowed_extensions`
        #[arg(long)]
        caller: String,

        /// Manifest type (stdio, storage, pkcs11)
        #[arg(long = "type", default_value = "stdio")]
        kind: ManifestType,
    },

    /// Send one JSON message and print the first reply
    Send {
        /// Application name
        name: String,

        /// Caller identity
        #[arg(long)]
        caller: String,

        /// Message as JSON text
        message: String,
    },

    /// Post each stdin line as a message; print replies as JSON lines
    Connect {
        /// Application name
        name: String,

        /// Caller identity
        #[arg(long)]
        caller: String,
    },

    /// Install a manifest file into the user (or system) search directory
    Install {
        /// Manifest JSON file
        manifest: PathBuf,

        /// Install for all users
        #[arg(long)]
        system: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let cfg = match path {
        Some(path) => {
            let mut cfg = BridgeConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            cfg.apply_env()?;
            cfg
        }
        None => BridgeConfig::from_env()?,
    };
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let bridge = Bridge::new(load_config(cli.config.as_deref())?)?;
    let result = run(&bridge, cli.command).await;
    bridge.shutdown().await;
    result
}

async fn run(bridge: &Bridge, command: Commands) -> Result<()> {
    match command {
        Commands::Lookup { name, caller, kind } => {
            let Some(found) = bridge.lookup_manifest(kind, &name, &CallerContext::new(caller))
            else {
                bail!("no valid {kind} manifest for {name}");
            };
            println!("{}", found.path.display());
            println!("{}", serde_json::to_string_pretty(&found.manifest)?);
            Ok(())
        }
        Commands::Send {
            name,
            caller,
            message,
        } => {
            let msg: Value = serde_json::from_str(&message).context("message is not valid JSON")?;
            let buffer = bridge.encode_message(&msg)?;
            let reply = bridge
                .send_native_message(&name, &CallerContext::new(caller), buffer)
                .await?;
            println!("{reply}");
            Ok(())
        }
        Commands::Connect { name, caller } => {
            connect(bridge, &name, &CallerContext::new(caller)).await
        }
        Commands::Install { manifest, system } => install(&manifest, system),
    }
}

async fn connect(bridge: &Bridge, name: &str, caller: &CallerContext) -> Result<()> {
    let mut port = bridge.connect(name, caller);
    let sender = port.sender();

    // Posting never blocks, so a plain thread can feed the port. It is left
    // behind on exit if stdin is still open.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let posted = serde_json::from_str::<Value>(&line)
                .map_err(anyhow::Error::from)
                .and_then(|msg| sender.post(&msg).map_err(anyhow::Error::from));
            if let Err(e) = posted {
                tracing::warn!(error = %e, "line not sent");
                if sender.is_closed() {
                    break;
                }
            }
        }
    });

    let outcome = loop {
        match port.next_event().await {
            Some(PortEvent::Message(msg)) => println!("{msg}"),
            Some(PortEvent::Disconnect(Disconnect::Clean)) | None => break Ok(()),
            Some(PortEvent::Disconnect(Disconnect::Error(e))) => break Err(e.into()),
        }
    };
    port.close();
    outcome
}

fn install(path: &Path, system: bool) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let manifest: NativeManifest =
        serde_json::from_str(&text).with_context(|| format!("invalid manifest {}", path.display()))?;
    let scope = if system { Scope::System } else { Scope::User };
    let installed = install_manifest(&manifest, scope)?;
    println!("{}", installed.display());
    Ok(())
}
