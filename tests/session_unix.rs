#![cfg(unix)]

mod common;

use common::{install_script_helper, CALLER};
use native_bridge::{
    Bridge, BridgeConfig, BridgeError, CallerContext, Disconnect, LocatorKind, Port, PortEvent,
};
use serde_json::{json, Value};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use tempfile::TempDir;
use tokio::time::timeout;

const ECHO: &str = "com.example.echo";
const LIMIT: Duration = Duration::from_secs(10);

struct Fixture {
    _td: TempDir,
    root: PathBuf,
    bridge: Bridge,
}

fn fixture(helpers: &[(&str, &str)], grace_ms: u64) -> Fixture {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().to_path_buf();
    for (name, body) in helpers {
        install_script_helper(&root, name, body);
    }
    let bridge = Bridge::new(BridgeConfig {
        locator: LocatorKind::Paths,
        manifest_dirs: Some(vec![root.clone()]),
        shutdown_grace: Duration::from_millis(grace_ms),
        ..BridgeConfig::default()
    })
    .unwrap();
    Fixture {
        _td: td,
        root,
        bridge,
    }
}

fn caller() -> CallerContext {
    CallerContext::new(CALLER)
}

async fn next(port: &mut Port) -> Option<PortEvent> {
    timeout(LIMIT, port.next_event()).await.expect("port event timed out")
}

async fn next_message(port: &mut Port) -> Value {
    match next(port).await {
        Some(PortEvent::Message(msg)) => msg,
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn next_disconnect(port: &mut Port) -> Disconnect {
    loop {
        match next(port).await {
            Some(PortEvent::Message(_)) => continue,
            Some(PortEvent::Disconnect(d)) => return d,
            None => panic!("session ended without a disconnect"),
        }
    }
}

#[tokio::test]
async fn echo_preserves_order_including_messages_posted_during_startup() {
    let fx = fixture(&[(ECHO, "exec cat")], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());

    // Nothing has been spawned yet; these are queued.
    for i in 0..20 {
        port.post(&json!({ "seq": i, "text": "héllo" })).unwrap();
    }
    for i in 0..20 {
        assert_eq!(next_message(&mut port).await, json!({ "seq": i, "text": "héllo" }));
    }

    port.close();
    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
}

#[tokio::test]
async fn helper_gets_manifest_path_and_caller_and_runs_in_its_directory() {
    let body = r#"{ printf '%s\n' "$1" "$2"; pwd; } > "$0.args"
exec cat"#;
    let fx = fixture(&[(ECHO, body)], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());

    // A reply proves the script got past writing its arguments.
    port.post(&json!("ping")).unwrap();
    assert_eq!(next_message(&mut port).await, json!("ping"));

    let bin = fx.root.join("bin");
    let recorded = std::fs::read_to_string(bin.join(format!("{ECHO}.sh.args"))).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    let manifest = fx
        .bridge
        .lookup_manifest(native_bridge::ManifestType::Stdio, ECHO, &caller())
        .unwrap();
    assert_eq!(lines[0], manifest.path.to_string_lossy());
    assert_eq!(lines[1], CALLER);
    assert_eq!(
        std::fs::canonicalize(lines[2]).unwrap(),
        std::fs::canonicalize(&bin).unwrap()
    );

    port.close();
    fx.bridge.shutdown().await;
}

#[tokio::test]
async fn stderr_output_does_not_disturb_framing() {
    let body = "echo 'starting up' >&2\nprintf 'no newline at the end' >&2\nexec cat";
    let fx = fixture(&[(ECHO, body)], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());

    port.post(&json!({ "a": [1, 2, 3] })).unwrap();
    assert_eq!(next_message(&mut port).await, json!({ "a": [1, 2, 3] }));

    port.close();
    fx.bridge.shutdown().await;
}

#[tokio::test]
async fn helper_exit_is_a_clean_disconnect() {
    let fx = fixture(&[(ECHO, "exit 0")], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());

    assert!(matches!(next(&mut port).await, Some(PortEvent::Disconnect(Disconnect::Clean))));
    assert!(next(&mut port).await.is_none());

    // Posting on a dead port fails right away.
    assert!(matches!(port.post(&json!(1)), Err(BridgeError::Disconnected)));
    fx.bridge.shutdown().await;
}

#[cfg(target_endian = "little")]
#[tokio::test]
async fn reply_then_exit_delivers_the_reply_before_the_disconnect() {
    // 7-byte frame: "hello" including the quotes.
    let body = r#"printf '\007\000\000\000"hello"'"#;
    let fx = fixture(&[(ECHO, body)], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());

    assert_eq!(next_message(&mut port).await, json!("hello"));
    assert!(matches!(next(&mut port).await, Some(PortEvent::Disconnect(Disconnect::Clean))));
    fx.bridge.shutdown().await;
}

#[cfg(target_endian = "little")]
#[tokio::test]
async fn truncated_frame_is_an_error_disconnect() {
    // Declares 8 bytes, delivers 2, exits.
    let body = r#"printf '\010\000\000\000{}'"#;
    let fx = fixture(&[(ECHO, body)], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());

    match next_disconnect(&mut port).await {
        Disconnect::Error(BridgeError::Io(e)) => {
            assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
        }
        other => panic!("expected an I/O error, got {other:?}"),
    }
    fx.bridge.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_ends_the_session() {
    let body = r#"printf '\377\377\377\377'
exec sleep 30"#;
    let fx = fixture(&[(ECHO, body)], 300);
    let mut port = fx.bridge.connect(ECHO, &caller());

    match next_disconnect(&mut port).await {
        Disconnect::Error(BridgeError::OversizedMessage { len, limit }) => {
            assert_eq!(len, u32::MAX);
            assert_eq!(limit, native_bridge::wire::MAX_READ);
        }
        other => panic!("expected an oversized message error, got {other:?}"),
    }
    // The sleeping helper ignores stdin and is terminated.
    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
}

#[tokio::test]
async fn lowered_input_limit_applies() {
    let td = tempfile::tempdir().unwrap();
    install_script_helper(td.path(), ECHO, "exec cat");
    let mut config = BridgeConfig {
        locator: LocatorKind::Paths,
        manifest_dirs: Some(vec![td.path().to_path_buf()]),
        ..BridgeConfig::default()
    };
    config.limits.set_max_read(8);
    let bridge = Bridge::new(config).unwrap();
    let mut port = bridge.connect(ECHO, &caller());

    port.post(&json!("short")).unwrap();
    assert_eq!(next_message(&mut port).await, json!("short"));

    port.post(&json!("this one is too long")).unwrap();
    assert!(matches!(
        next_disconnect(&mut port).await,
        Disconnect::Error(BridgeError::OversizedMessage { limit: 8, .. })
    ));
    bridge.shutdown().await;
}

#[tokio::test]
async fn oversized_post_fails_synchronously_and_keeps_the_session() {
    let td = tempfile::tempdir().unwrap();
    install_script_helper(td.path(), ECHO, "exec cat");
    let mut config = BridgeConfig {
        locator: LocatorKind::Paths,
        manifest_dirs: Some(vec![td.path().to_path_buf()]),
        ..BridgeConfig::default()
    };
    config.limits.set_max_write(16);
    let bridge = Bridge::new(config).unwrap();
    let mut port = bridge.connect(ECHO, &caller());

    let err = port.post_message(vec![b'1'; 17]).unwrap_err();
    assert!(matches!(err, BridgeError::WriteTooLarge { len: 17, limit: 16 }));

    port.post_message(b"[16]".to_vec()).unwrap();
    assert_eq!(next_message(&mut port).await, json!([16]));

    port.close();
    bridge.shutdown().await;
}

#[tokio::test]
async fn unknown_and_forbidden_look_the_same() {
    let fx = fixture(&[(ECHO, "exec cat")], 1000);

    let mut missing = fx.bridge.connect("com.example.missing", &caller());
    let mut forbidden = fx
        .bridge
        .connect(ECHO, &CallerContext::new("ext-id-2@example.org"));

    let missing = next_disconnect(&mut missing).await.into_error().unwrap();
    let forbidden = next_disconnect(&mut forbidden).await.into_error().unwrap();
    assert_eq!(missing.to_string(), "No such native application com.example.missing");
    assert_eq!(forbidden.to_string(), format!("No such native application {ECHO}"));
    fx.bridge.shutdown().await;
}

#[tokio::test]
async fn missing_executable_is_a_startup_error() {
    let fx = fixture(&[], 1000);
    common::write_manifest(
        &fx.root,
        native_bridge::ManifestType::Stdio,
        ECHO,
        &common::stdio_manifest(ECHO, &fx.root.join("bin/does-not-exist"), &[CALLER]),
    );
    let mut port = fx.bridge.connect(ECHO, &caller());
    assert!(matches!(
        next_disconnect(&mut port).await,
        Disconnect::Error(BridgeError::Spawn { .. })
    ));
    fx.bridge.shutdown().await;
}

#[tokio::test]
async fn closing_the_port_sends_no_notification() {
    let fx = fixture(&[(ECHO, "exec cat")], 1000);
    let port = fx.bridge.connect(ECHO, &caller());
    let (sender, mut messages, signal) = port.split();
    let signal = signal.unwrap();

    sender.post(&json!("one")).unwrap();
    assert_eq!(
        timeout(LIMIT, messages.recv()).await.unwrap(),
        Some(json!("one"))
    );

    sender.close();
    assert!(sender.is_closed());
    assert!(matches!(sender.post(&json!("two")), Err(BridgeError::Disconnected)));
    assert!(timeout(LIMIT, signal).await.unwrap().is_none());
    assert!(timeout(LIMIT, messages.recv()).await.unwrap().is_none());

    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
}

/// Echoes one 8-byte frame, then answers the next input with an oversized
/// prefix. Appends a line to `$0.log` once its stdin is closed.
const RACER: &str = r#"trap '' PIPE
head -c 8
head -c 1 > /dev/null
printf '\377\377\377\377'
cat > /dev/null
echo down >> "$0.log"
"#;

fn teardown_count(fx: &Fixture, name: &str) -> usize {
    std::fs::read_to_string(fx.root.join("bin").join(format!("{name}.sh.log")))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_racing_close_cleans_up_once() {
    const ROUNDS: usize = 16;
    let fx = fixture(&[(ECHO, RACER)], 2000);

    for round in 0..ROUNDS {
        let port = fx.bridge.connect(ECHO, &caller());
        let (sender, mut messages, signal) = port.split();
        let signal = signal.unwrap();

        // Live helper: the first frame comes back.
        sender.post(&json!("hi")).unwrap();
        assert_eq!(timeout(LIMIT, messages.recv()).await.unwrap(), Some(json!("hi")));

        // The helper now fails the transport while the caller closes.
        sender.post(&json!("go")).unwrap();
        tokio::time::sleep(Duration::from_micros((round % 4) as u64 * 500)).await;
        sender.close();

        match timeout(LIMIT, signal).await.unwrap() {
            None => {}
            Some(Disconnect::Error(BridgeError::OversizedMessage { .. })) => {}
            other => panic!("round {round}: unexpected notification {other:?}"),
        }
        assert!(timeout(LIMIT, messages.recv()).await.unwrap().is_none());
        assert!(matches!(sender.post(&json!(1)), Err(BridgeError::Disconnected)));
    }

    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
    assert_eq!(fx.bridge.active_sessions(), 0);
    assert_eq!(teardown_count(&fx, ECHO), ROUNDS);
}

#[tokio::test]
async fn transport_error_after_close_is_not_reported() {
    // Writes an oversized prefix only once stdin is closed.
    let body = r#"trap '' PIPE
head -c 8
cat > /dev/null
printf '\377\377\377\377'
echo down >> "$0.log"
"#;
    let fx = fixture(&[(ECHO, body)], 2000);
    let port = fx.bridge.connect(ECHO, &caller());
    let (sender, mut messages, signal) = port.split();
    let signal = signal.unwrap();

    sender.post(&json!("hi")).unwrap();
    assert_eq!(timeout(LIMIT, messages.recv()).await.unwrap(), Some(json!("hi")));

    sender.close();
    assert!(timeout(LIMIT, signal).await.unwrap().is_none());
    assert!(timeout(LIMIT, messages.recv()).await.unwrap().is_none());

    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
    assert_eq!(teardown_count(&fx, ECHO), 1);
}

#[tokio::test]
async fn dropping_the_port_closes_the_session() {
    let fx = fixture(&[(ECHO, "exec cat")], 1000);
    let mut port = fx.bridge.connect(ECHO, &caller());
    port.post(&json!("x")).unwrap();
    assert_eq!(next_message(&mut port).await, json!("x"));
    assert_eq!(fx.bridge.active_sessions(), 1);

    drop(port);
    let deadline = Instant::now() + LIMIT;
    while fx.bridge.active_sessions() > 0 {
        assert!(Instant::now() < deadline, "session did not end after drop");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn send_native_message_returns_the_first_reply() {
    // Swallows exactly one 2-byte request, then exits without answering.
    let fx = fixture(
        &[(ECHO, "exec cat"), ("com.example.silent", "head -c 6 > /dev/null")],
        1000,
    );

    let request = fx.bridge.encode_message(&json!({ "cmd": "version" })).unwrap();
    let reply = timeout(
        LIMIT,
        fx.bridge.send_native_message(ECHO, &caller(), request),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply, json!({ "cmd": "version" }));

    let silent = timeout(
        LIMIT,
        fx.bridge
            .send_native_message("com.example.silent", &caller(), b"{}".to_vec()),
    )
    .await
    .unwrap();
    assert!(matches!(silent, Err(BridgeError::Disconnected)));

    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
}

#[cfg(target_endian = "little")]
#[tokio::test]
async fn stubborn_helper_does_not_block_shutdown() {
    // Ignores stdin close and SIGTERM; only the forced kill gets through.
    let body = r#"trap '' TERM
printf '\007\000\000\000"ready"'
while :; do sleep 1; done"#;
    let grace = Duration::from_millis(200);
    let fx = fixture(&[(ECHO, body)], grace.as_millis() as u64);
    let mut port = fx.bridge.connect(ECHO, &caller());
    assert_eq!(next_message(&mut port).await, json!("ready"));

    let started = Instant::now();
    port.close();
    timeout(LIMIT, fx.bridge.shutdown()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= grace * 2, "escalated too early: {elapsed:?}");
    assert!(elapsed < grace * 3 + Duration::from_secs(2), "took {elapsed:?}");
}
