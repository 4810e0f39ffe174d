use std::io;

/// Errors produced by the bridge.
///
/// Manifest problems never show up here in detail: every lookup or validation
/// failure collapses into [`BridgeError::NoSuchNativeApplication`] so a caller
/// without the right identity cannot tell "not installed" from "not allowed".
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("No such native application {0}")]
    NoSuchNativeApplication(String),

    #[error(
        "Native application tried to send a message of {len} bytes, which exceeds the limit of {limit} bytes."
    )]
    OversizedMessage { len: u32, limit: u32 },

    #[error("Write too big: {len} bytes exceeds the limit of {limit} bytes")]
    WriteTooLarge { len: usize, limit: u64 },

    #[error("failed to start native application {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON from native application: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("native application sent a message that is not valid UTF-8")]
    InvalidUtf8,

    #[error("Attempt to postMessage on disconnected port")]
    Disconnected,

    #[error("native messaging broker error: {0}")]
    Broker(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// True when a read error at a frame boundary only says the helper closed its
/// end of the pipe. Some platforms report that as `BrokenPipe`.
pub(crate) fn is_eof_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::BrokenPipe)
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_error_names_only_the_application() {
        let e = BridgeError::NoSuchNativeApplication("com.example.echo".into());
        assert_eq!(e.to_string(), "No such native application com.example.echo");
    }

    #[test]
    fn end_of_stream_classification() {
        assert!(is_eof_kind(io::ErrorKind::BrokenPipe));
        // A frame cut off half way is not a clean disconnect.
        assert!(!is_eof_kind(io::ErrorKind::UnexpectedEof));
        assert!(!is_eof_kind(io::ErrorKind::ConnectionReset));
    }
}
