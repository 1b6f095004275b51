//! Message flow between the editor side and a running server.

use std::sync::Arc;

use serde_json::json;

use devbridge_lsp::{
    BridgeError, BridgeTimeouts, BufferId, BufferRef, ClientEvent, ClientState, MappingError,
    Message, RequestId, TranslationMode,
};

use crate::common::{
    self, Behavior, FakeRunner, HOST_ROOT, container_uri, events_until, gopls, host_uri,
    wait_ready,
};

fn is_reply_to(event: &ClientEvent, id: i64) -> bool {
    matches!(event, ClientEvent::Message { message, .. } if message.id == Some(RequestId::Number(id)))
}

fn last_message(events: &[ClientEvent]) -> Message {
    match events.last() {
        Some(ClientEvent::Message { message, .. }) => message.clone(),
        other => panic!("expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn definition_round_trip_translates_both_ways() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    let handle = registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;

    handle
        .request(
            1,
            "textDocument/definition",
            Some(json!({
                "textDocument": { "uri": host_uri("pkg/util.go") },
                "position": { "line": 10, "character": 4 }
            })),
        )
        .unwrap();
    let events = events_until(&mut registry, |e| is_reply_to(e, 1)).await;

    let sent = runner.inbox.find("textDocument/definition").unwrap();
    assert_eq!(
        sent.params.unwrap()["textDocument"]["uri"],
        json!(container_uri("pkg/util.go"))
    );

    let reply = last_message(&events);
    let locations = reply.result.unwrap();
    assert_eq!(locations[0]["uri"], json!(host_uri("pkg/util.go")));
    assert_eq!(locations[0]["range"]["start"]["line"], json!(3));

    registry.stop_all().await;
}

#[tokio::test]
async fn traffic_before_ready_is_held_until_initialized() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    let handle = registry.get_or_create(&gopls()).unwrap();
    handle
        .notify(
            "textDocument/didOpen",
            Some(json!({
                "textDocument": {
                    "uri": host_uri("cmd/main.go"),
                    "languageId": "go",
                    "version": 1,
                    "text": "package main\n"
                }
            })),
        )
        .unwrap();

    let events = events_until(&mut registry, |e| {
        matches!(e, ClientEvent::Message { message, .. }
            if message.method() == Some("textDocument/publishDiagnostics"))
    })
    .await;

    assert_eq!(
        runner.inbox.methods(),
        vec!["initialize", "initialized", "textDocument/didOpen"]
    );
    let ready_at = events
        .iter()
        .position(|e| matches!(e, ClientEvent::StateChanged { state: ClientState::Ready, .. }))
        .unwrap();
    assert_eq!(ready_at, events.len() - 2);

    let diagnostics = last_message(&events).params.unwrap();
    assert_eq!(diagnostics["uri"], json!(host_uri("cmd/main.go")));
    assert_eq!(diagnostics["diagnostics"][0]["severity"], json!(2));

    registry.stop_all().await;
}

#[tokio::test]
async fn passthrough_leaves_paths_alone() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry =
        common::registry_with(runner.clone(), TranslationMode::Passthrough, BridgeTimeouts::default());
    let handle = registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;

    let init = runner.inbox.find("initialize").unwrap().params.unwrap();
    assert_eq!(init["rootUri"], json!(format!("file://{HOST_ROOT}")));

    handle
        .request(
            "def-1",
            "textDocument/definition",
            Some(json!({
                "textDocument": { "uri": host_uri("main.go") },
                "position": { "line": 0, "character": 0 }
            })),
        )
        .unwrap();
    let events = events_until(&mut registry, |e| {
        matches!(e, ClientEvent::Message { message, .. }
            if message.id == Some(RequestId::String("def-1".into())))
    })
    .await;
    let reply = last_message(&events);
    assert_eq!(reply.result.unwrap()[0]["uri"], json!(host_uri("main.go")));

    assert_eq!(
        registry.configure_mapping(HOST_ROOT, "/workspace").unwrap_err(),
        MappingError::Passthrough
    );
    registry.stop_all().await;
}

#[tokio::test]
async fn mapping_can_be_configured_after_start() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry_with(
        runner.clone(),
        TranslationMode::Unconfigured,
        BridgeTimeouts::default(),
    );
    let handle = registry.get_or_create(&gopls()).unwrap();
    wait_ready(&mut registry, "gopls").await;

    let health = registry.health_check("gopls");
    assert!(health.reachable);
    assert!(
        health
            .issues
            .contains(&String::from("workspace mapping is not configured")),
        "{health:?}"
    );

    registry
        .configure_mapping(HOST_ROOT, common::CONTAINER_ROOT)
        .unwrap();
    assert!(registry.health_check("gopls").is_healthy());

    handle
        .request(
            2,
            "textDocument/definition",
            Some(json!({
                "textDocument": { "uri": host_uri("main.go") },
                "position": { "line": 0, "character": 0 }
            })),
        )
        .unwrap();
    let events = events_until(&mut registry, |e| is_reply_to(e, 2)).await;
    assert_eq!(
        runner
            .inbox
            .find("textDocument/definition")
            .unwrap()
            .params
            .unwrap()["textDocument"]["uri"],
        json!(container_uri("main.go"))
    );
    assert_eq!(
        last_message(&events).result.unwrap()[0]["uri"],
        json!(host_uri("main.go"))
    );
    registry.stop_all().await;
}

#[tokio::test]
async fn malformed_and_reserved_messages_are_rejected() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());
    let handle = registry.get_or_create(&gopls()).unwrap();

    assert!(matches!(
        handle.request("devbridge:0", "textDocument/hover", None),
        Err(BridgeError::Protocol(_))
    ));
    assert!(matches!(
        handle.send(Message::default()),
        Err(BridgeError::Protocol(_))
    ));

    wait_ready(&mut registry, "gopls").await;
    registry.stop_all().await;
    assert!(
        !runner
            .inbox
            .methods()
            .contains(&String::from("textDocument/hover"))
    );
}

#[tokio::test]
async fn buffers_start_and_share_the_filetype_server() {
    let runner = Arc::new(FakeRunner::new(Behavior::Healthy));
    let mut registry = common::registry(runner.clone());

    let main = BufferRef::new(1, format!("{HOST_ROOT}/main.go"), "go");
    let util = BufferRef::new(2, format!("{HOST_ROOT}/pkg/util.go"), "go");
    let first = registry.start_for_buffer(main).unwrap().unwrap();
    let second = registry.start_for_buffer(util).unwrap().unwrap();
    assert_eq!(first.server(), "gopls");
    assert_eq!(first.generation(), second.generation());
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(registry.buffers("gopls").len(), 2);

    let markdown = BufferRef::new(3, format!("{HOST_ROOT}/README.md"), "markdown");
    assert!(registry.start_for_buffer(markdown).unwrap().is_none());

    assert!(registry.detach_buffer("gopls", BufferId(1)));
    assert!(!registry.detach_buffer("gopls", BufferId(1)));
    assert_eq!(registry.buffers("gopls").len(), 1);

    wait_ready(&mut registry, "gopls").await;
    registry.stop_all().await;
    assert!(registry.buffers("gopls").is_empty());
}
