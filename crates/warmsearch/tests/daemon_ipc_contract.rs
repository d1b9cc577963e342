mod support;

use std::time::{Duration, Instant};
use support::{daemon_config, raw_exchange, start, ScriptedBrowser};
use warmsearch::config::ClientConfig;
use warmsearch::lifecycle::ShutdownReason;
use warmsearch::protocol::BrowserState;
use warmsearch::{ClientError, DaemonClient};

fn client_for(socket: &std::path::Path) -> DaemonClient {
    DaemonClient::new(ClientConfig {
        socket_path: socket.to_path_buf(),
        auto_spawn: false,
        ..ClientConfig::default()
    })
}

#[tokio::test]
async fn status_is_answered_while_the_browser_is_still_starting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = daemon_config(dir.path());
    let socket = config.socket_path.clone();
    let d = start(
        config,
        ScriptedBrowser {
            launch_delay: Duration::from_millis(800),
            ..Default::default()
        },
    )
    .await;

    let t0 = Instant::now();
    let status = client_for(&socket).status().await.expect("status");
    assert!(t0.elapsed() < Duration::from_millis(500));
    assert_eq!(status.status, "running");
    assert_eq!(status.browser, BrowserState::Initializing);
    assert_eq!(status.cache_size, 0);

    d.ctx
        .lifecycle()
        .request_shutdown(ShutdownReason::Signal("SIGTERM"));
    d.handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn capital_of_france_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = daemon_config(dir.path());
    let socket = config.socket_path.clone();
    let d = start(
        config,
        ScriptedBrowser {
            nav_delay: Duration::from_millis(600),
            ..Default::default()
        },
    )
    .await;

    let search = {
        let socket = socket.clone();
        tokio::spawn(async move { client_for(&socket).search("capital of France").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Status does not wait behind the in-flight search.
    let t_status = Instant::now();
    let status = client_for(&socket).status().await.expect("status");
    assert!(t_status.elapsed() < Duration::from_millis(400));
    assert_eq!(status.active, Some(1));

    let first = search.await.expect("join").expect("first search");
    assert!(!first.from_cache);
    assert!(first.markdown.contains("Paris"));
    assert!(first.time_ms >= 600);

    let second = client_for(&socket)
        .search("Capital of France")
        .await
        .expect("second search");
    assert!(second.from_cache);
    assert_eq!(second.markdown, first.markdown);
    assert!(second.time_ms < first.time_ms);

    let status = client_for(&socket).status().await.expect("status");
    assert_eq!(status.cache_size, 1);
    assert_eq!(status.browser, BrowserState::Connected);

    assert!(client_for(&socket).stop().await.expect("stop"));
    assert_eq!(
        d.handle.await.expect("join").expect("run"),
        ShutdownReason::StopRequest
    );
    assert!(!socket.exists());
}

#[tokio::test]
async fn malformed_and_partial_requests() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = daemon_config(dir.path());
    let socket = config.socket_path.clone();
    let d = start(config, ScriptedBrowser::default()).await;

    let bad = raw_exchange(&socket, &[b"this is not json\n".as_slice()], Duration::ZERO).await;
    assert_eq!(bad["code"], "protocol_error");
    assert!(bad["error"].as_str().is_some_and(|e| !e.is_empty()));
    assert!(bad["hint"].is_string());

    let split = raw_exchange(
        &socket,
        &[b"{\"query\":\"__STA".as_slice(), b"TUS__\"}\n".as_slice()],
        Duration::from_millis(50),
    )
    .await;
    assert_eq!(split["status"], "running");
    assert!(split["uptime"].is_u64());

    // The daemon is still healthy after a bad client.
    client_for(&socket).status().await.expect("status");

    d.ctx.lifecycle().request_shutdown(ShutdownReason::StopRequest);
    d.handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn locked_profile_is_reported_with_a_hint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = daemon_config(dir.path());
    let socket = config.socket_path.clone();
    let d = start(
        config,
        ScriptedBrowser {
            locked_profile: true,
            ..Default::default()
        },
    )
    .await;

    let err = client_for(&socket)
        .search("anything")
        .await
        .expect_err("locked profile");
    match &err {
        ClientError::Server { code, hint, .. } => {
            assert_eq!(code.as_deref(), Some("profile_locked"));
            assert!(hint.as_deref().is_some_and(|h| h.contains("WARMSEARCH_PROFILE_DIR")));
        }
        other => panic!("unexpected {other:?}"),
    }

    d.ctx.lifecycle().request_shutdown(ShutdownReason::StopRequest);
    d.handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn idle_daemon_removes_its_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = daemon_config(dir.path());
    config.idle_timeout = Duration::from_millis(400);
    let socket = config.socket_path.clone();
    let d = start(config, ScriptedBrowser::default()).await;
    assert!(socket.exists());

    let reason = tokio::time::timeout(Duration::from_secs(10), d.handle)
        .await
        .expect("idle exit")
        .expect("join")
        .expect("run");
    assert_eq!(reason, ShutdownReason::IdleTimeout);
    assert!(!socket.exists());
    assert!(matches!(
        client_for(&socket).status().await,
        Err(ClientError::NotRunning(_))
    ));
}
