//! Client lifecycle through the registry: start, handshake, failure, stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use devbridge_lsp::{
    BridgeError, BridgeTimeouts, BufferRef, ClientState, ServerConfig, Strategy,
};

use crate::common::{
    self, Behavior, FakeRunner, HOST_ROOT, eventually, gopls, states, wait_for_state, wait_ready,
};

fn pyright() -> ServerConfig {
    ServerConfig::new("pyright", "pyright-langserver", ["python"])
        .unwrap()
        .with_args(["--stdio"])
}

#[tokio::test]
async fn get_or_create_reuses_the_live_client() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());

    let first = registry.get_or_create(&gopls()).unwrap();
    let second = registry.get_or_create(&gopls()).unwrap();
    assert_eq!(first.generation(), second.generation());
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(registry.len(), 1);

    wait_ready(&mut registry, "gopls").await;
    let third = registry.get_or_create(&gopls()).unwrap();
    assert_eq!(third.generation(), first.generation());
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(runner.spawned_argv(), vec![vec![String::from("gopls")]]);

    registry.stop_all().await;
}

#[tokio::test]
async fn handshake_runs_inside_the_container_namespace() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    registry.get_or_create(&gopls()).unwrap();

    let events = wait_ready(&mut registry, "gopls").await;
    assert_eq!(
        states(&events, "gopls"),
        vec![
            ClientState::Starting,
            ClientState::Initializing,
            ClientState::Ready
        ]
    );

    let initialize = runner.inbox.find("initialize").unwrap();
    let params = initialize.params.unwrap();
    assert_eq!(params["processId"], Value::Null);
    assert_eq!(params["rootUri"], json!("file:///workspace"));
    assert_eq!(params["workspaceFolders"][0]["uri"], json!("file:///workspace"));

    // The stored result is in host terms.
    let result = registry.initialize_result("gopls").unwrap();
    assert_eq!(result["serverInfo"]["name"], json!("fake-ls"));
    assert_eq!(result["workspace"]["rootUri"], json!(format!("file://{HOST_ROOT}")));

    let health = registry.health_check("gopls");
    assert!(health.is_healthy(), "{health:?}");
    assert_eq!(health.state, Some(ClientState::Ready));
    assert_eq!(health.strategy, Some(Strategy::Rewrite));

    registry.stop_all().await;
}

#[tokio::test]
async fn editor_initialize_params_are_forwarded_with_container_paths() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    let editor_params = json!({
        "processId": 4242,
        "rootUri": format!("file://{HOST_ROOT}"),
        "capabilities": { "general": { "positionEncodings": ["utf-16"] } },
        "initializationOptions": { "staticcheck": true }
    });
    registry
        .get_or_create_with(
            &gopls().with_settings(json!({ "ignored": true })),
            devbridge_lsp::ClientOptions {
                initialize_params: Some(editor_params),
                root: None,
            },
        )
        .unwrap();
    wait_ready(&mut registry, "gopls").await;

    let params = runner.inbox.find("initialize").unwrap().params.unwrap();
    assert_eq!(params["processId"], Value::Null);
    assert_eq!(params["rootUri"], json!("file:///workspace"));
    assert_eq!(params["initializationOptions"], json!({ "staticcheck": true }));
    assert_eq!(
        params["capabilities"]["general"]["positionEncodings"],
        json!(["utf-16"])
    );

    registry.stop_all().await;
}

#[tokio::test]
async fn stop_sends_shutdown_and_exit() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;

    registry.stop("gopls").await;
    let events = registry.poll_events(16);
    assert_eq!(
        states(&events, "gopls"),
        vec![ClientState::Stopping, ClientState::Stopped]
    );
    assert!(!registry.client_exists("gopls"));
    assert_eq!(registry.get_state("gopls"), None);

    let methods = runner.inbox.methods();
    assert!(methods.contains(&String::from("shutdown")), "{methods:?}");
    assert!(methods.contains(&String::from("exit")), "{methods:?}");

    // Stopping something that isn't there is fine.
    registry.stop("gopls").await;
    registry.stop("never-started").await;
}

#[tokio::test]
async fn stop_kills_a_server_that_ignores_shutdown() {
    let runner = Arc::new(FakeRunner::new(Behavior::IgnoreShutdown));
    let mut registry = common::registry_with(
        runner.clone(),
        common::rewrite_mode(),
        BridgeTimeouts {
            init_timeout_secs: 30,
            stop_timeout_secs: 1,
        },
    );
    registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;
    assert_eq!(runner.live_servers(), 1);

    let started = Instant::now();
    registry.stop("gopls").await;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(3), "stop took {elapsed:?}");

    assert!(!registry.client_exists("gopls"));
    assert_eq!(
        states(&registry.poll_events(16), "gopls"),
        vec![ClientState::Stopping, ClientState::Stopped]
    );
    assert!(runner.inbox.methods().contains(&String::from("shutdown")));
    eventually(|| runner.live_servers() == 0).await;
}

#[tokio::test]
async fn stop_during_handshake_discards_held_traffic() {
    let runner = Arc::new(FakeRunner::new(Behavior::HangOnInitialize));
    let mut registry = common::registry(runner.clone());
    let handle = registry.get_or_create(&gopls()).unwrap();
    handle
        .notify(
            "textDocument/didOpen",
            Some(json!({ "textDocument": { "uri": common::host_uri("a.go") } })),
        )
        .unwrap();
    wait_for_state(&mut registry, "gopls", |s| *s == ClientState::Initializing).await;
    eventually(|| runner.inbox.find("initialize").is_some()).await;

    registry.stop("gopls").await;
    assert!(!registry.client_exists("gopls"));
    assert_eq!(
        states(&registry.poll_events(16), "gopls"),
        vec![ClientState::Stopping, ClientState::Stopped]
    );
    assert!(matches!(
        handle.notify("textDocument/didClose", None),
        Err(BridgeError::Closed { .. })
    ));

    eventually(|| runner.live_servers() == 0).await;
    assert_eq!(runner.inbox.methods(), vec![String::from("initialize")]);
}

#[tokio::test]
async fn stop_all_returns_to_an_empty_registry() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    let before = registry.get_or_create(&gopls()).unwrap();
    registry.get_or_create(&pyright()).unwrap();

    let mut ready = 0;
    common::events_until(&mut registry, |event| {
        if matches!(
            event,
            devbridge_lsp::ClientEvent::StateChanged {
                state: ClientState::Ready,
                ..
            }
        ) {
            ready += 1;
        }
        ready == 2
    })
    .await;

    registry.stop_all().await;
    assert!(registry.is_empty());
    assert!(registry.poll_events(64).is_empty());
    let health = registry.health_check("gopls");
    assert!(!health.reachable);
    assert_eq!(health.issues, vec![String::from("no client for 'gopls'")]);

    let after = registry.get_or_create(&gopls()).unwrap();
    assert!(after.generation() > before.generation());
    assert_eq!(runner.spawn_count(), 3);
    wait_ready(&mut registry, "gopls").await;
    registry.stop_all().await;
}

#[tokio::test]
async fn spawn_failure_is_reported_and_retried_on_request() {
    let runner = Arc::new(FakeRunner::new(Behavior::FailSpawn));
    let mut registry = common::registry(runner.clone());

    let err = registry.get_or_create(&gopls()).unwrap_err();
    match &err {
        BridgeError::StartFailed { server, reason } => {
            assert_eq!(server, "gopls");
            assert!(reason.contains("devbox is not running"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!registry.client_exists("gopls"));

    let health = registry.health_check("gopls");
    assert!(!health.reachable);
    assert!(matches!(health.state, Some(ClientState::Failed(_))));
    assert!(health.issues[0].contains("failed to start 'gopls'"), "{health:?}");

    let events = registry.poll_events(8);
    assert!(matches!(
        states(&events, "gopls").as_slice(),
        [ClientState::Failed(_)]
    ));

    runner.set_behavior(Behavior::Healthy);
    registry.get_or_create(&gopls()).unwrap();
    assert_eq!(runner.spawn_count(), 2);
    wait_ready(&mut registry, "gopls").await;
    registry.stop_all().await;
}

#[tokio::test]
async fn initialize_timeout_fails_the_client() {
    let runner = Arc::new(FakeRunner::new(Behavior::HangOnInitialize));
    let mut registry = common::registry_with(
        runner.clone(),
        common::rewrite_mode(),
        BridgeTimeouts {
            init_timeout_secs: 1,
            stop_timeout_secs: 1,
        },
    );
    let handle = registry.get_or_create(&gopls()).unwrap();
    handle
        .notify("textDocument/didOpen", Some(json!({ "textDocument": { "uri": common::host_uri("a.go") } })))
        .unwrap();

    let events = wait_for_state(&mut registry, "gopls", |s| matches!(s, ClientState::Failed(_))).await;
    let Some(ClientState::Failed(reason)) = states(&events, "gopls").pop() else {
        panic!("no failure in {events:?}");
    };
    assert!(reason.contains("initialize timed out"), "{reason}");

    // Held-back traffic never reached the server.
    assert_eq!(runner.inbox.methods(), vec![String::from("initialize")]);
    assert!(!registry.client_exists("gopls"));
    registry.stop_all().await;
}

#[tokio::test]
async fn crash_after_ready_detaches_buffers() {
    let runner = Arc::new(FakeRunner::new(Behavior::CrashAfterInitialized));
    let mut registry = common::registry(runner.clone());
    registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;

    let buffer = BufferRef::new(1, format!("{HOST_ROOT}/main.go"), "go");
    assert!(registry.attach_buffer("gopls", buffer.clone()).unwrap());
    assert_eq!(registry.buffers("gopls"), vec![buffer.clone()]);

    let events = wait_for_state(&mut registry, "gopls", |s| matches!(s, ClientState::Failed(_))).await;
    let Some(ClientState::Failed(reason)) = states(&events, "gopls").pop() else {
        panic!("no failure in {events:?}");
    };
    assert_eq!(reason, "process exited with code 2");

    assert!(registry.buffers("gopls").is_empty());
    assert!(matches!(
        registry.attach_buffer("gopls", buffer),
        Err(BridgeError::NotRunning { .. })
    ));
    let health = registry.health_check("gopls");
    assert!(!health.is_healthy());
    assert!(health.issues[0].contains("'gopls' exited"), "{health:?}");

    // Not respawned on its own; an explicit request starts a new generation.
    assert_eq!(runner.spawn_count(), 1);
    runner.set_behavior(Behavior::Healthy);
    registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;
    assert_eq!(runner.spawn_count(), 2);
    registry.stop_all().await;
}

#[tokio::test]
async fn immediate_exit_fails_without_touching_other_clients() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    registry.get_or_create(&pyright()).unwrap();
    wait_ready(&mut registry, "pyright").await;

    runner.set_behavior(Behavior::ExitImmediately(3));
    registry.get_or_create(&gopls()).unwrap();
    wait_for_state(&mut registry, "gopls", |s| matches!(s, ClientState::Failed(_))).await;

    assert!(!registry.client_exists("gopls"));
    assert!(registry.client_exists("pyright"));
    assert_eq!(registry.get_state("pyright"), Some(ClientState::Ready));
    registry.stop_all().await;
}
