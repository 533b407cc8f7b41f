// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios driven over a real WebSocket connection
//! against an in-process server with the echo backend.

use serde_json::json;

use pimux_specs::{spec_config, SpecServer};

// -- Handshake ----------------------------------------------------------------

#[tokio::test]
async fn handshake_announces_protocol() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let (stream, _) = tokio_tungstenite::connect_async(server.ws_url()).await?;
    let mut stream = stream;

    use futures_util::StreamExt;
    let msg = tokio::time::timeout(pimux_specs::TIMEOUT, stream.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("closed"))??;
    let text = match msg {
        tokio_tungstenite::tungstenite::Message::Text(t) => t.to_string(),
        other => anyhow::bail!("expected text frame, got {other:?}"),
    };
    let ready: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(ready["type"], "server_ready");
    assert!(ready["data"]["serverVersion"].is_string());
    assert!(ready["data"]["protocolVersion"].is_string());
    let transports = ready["data"]["transports"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("missing transports"))?;
    assert!(transports.contains(&json!("websocket")));
    assert!(transports.contains(&json!("stdio")));
    Ok(())
}

// -- Basic command flow -------------------------------------------------------

#[tokio::test]
async fn create_prompt_and_event_stream() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    let created = client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c1" }))
        .await?;
    assert_eq!(created["success"], true);

    // session_created reached this (unsubscribed) client as a global
    // lifecycle event.
    client
        .wait_for(|f| f["type"] == "session_created" && f["sessionId"] == "s1")
        .await?;

    let switched = client
        .round_trip(json!({ "type": "switch_session", "sessionId": "s1", "id": "c2" }))
        .await?;
    assert_eq!(switched["success"], true);

    client.send(json!({
        "type": "prompt", "sessionId": "s1", "id": "p1", "message": "hello",
    })).await?;

    // Subscribers see the wrapped agent events.
    let event = client
        .wait_for(|f| f["type"] == "event" && f["event"]["type"] == "text")
        .await?;
    assert_eq!(event["sessionId"], "s1");
    assert_eq!(event["event"]["text"], "echo: hello");

    let resp = client.response_for("p1").await?;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["sessionVersion"], 1);
    assert_eq!(resp["data"]["text"], "echo: hello");

    // Lifecycle triple for p1 was broadcast as well.
    Ok(())
}

// -- Scenario 1: replay returns the same timeout ------------------------------

#[tokio::test]
async fn replay_returns_same_timeout() -> anyhow::Result<()> {
    let mut config = spec_config(0);
    config.long_timeout_ms = 150;
    let server = SpecServer::start_with(config).await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c0" }))
        .await?;

    let frame = json!({
        "type": "prompt", "sessionId": "s1", "id": "c1", "message": "sleep:5000",
    });
    let first = client.round_trip(frame.clone()).await?;
    assert_eq!(first["success"], false);
    assert_eq!(first["timedOut"], true);

    let second = client.round_trip(frame).await?;
    assert_eq!(second["replayed"], true);
    let mut expected = first.clone();
    if let Some(obj) = expected.as_object_mut() {
        obj.insert("replayed".to_owned(), json!(true));
    }
    assert_eq!(second, expected);
    Ok(())
}

// -- Scenario 2: fingerprint conflict on id -----------------------------------

#[tokio::test]
async fn fingerprint_conflict_on_id() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c0" }))
        .await?;

    let first = client
        .round_trip(json!({
            "type": "prompt", "sessionId": "s1", "id": "c2", "message": "a",
        }))
        .await?;
    assert_eq!(first["success"], true);

    let conflict = client
        .round_trip(json!({
            "type": "prompt", "sessionId": "s1", "id": "c2", "message": "b",
        }))
        .await?;
    assert_eq!(conflict["success"], false);
    let error = conflict["error"].as_str().unwrap_or_default();
    assert!(error.contains("conflict"), "error was: {error}");

    // Stored outcome unchanged.
    let replay = client
        .round_trip(json!({
            "type": "prompt", "sessionId": "s1", "id": "c2", "message": "a",
        }))
        .await?;
    assert_eq!(replay["replayed"], true);
    assert_eq!(replay["success"], true);
    assert_eq!(replay["data"], first["data"]);
    Ok(())
}

// -- Scenario 3: same-lane causal order ---------------------------------------

#[tokio::test]
async fn same_lane_causal_order_on_the_wire() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c0" }))
        .await?;

    client.send(json!({
        "type": "prompt", "sessionId": "s1", "id": "A", "message": "sleep:100",
    })).await?;
    client.send(json!({
        "type": "prompt", "sessionId": "s1", "id": "B",
        "dependsOn": ["A"], "message": "after",
    })).await?;

    let mut order = Vec::new();
    while order.len() < 6 {
        let frame = client
            .wait_for(|f| {
                let id = &f["commandId"];
                (id == "A" || id == "B")
                    && matches!(
                        f["type"].as_str(),
                        Some("command_accepted" | "command_started" | "command_finished")
                    )
            })
            .await?;
        let tag = frame["type"].as_str().unwrap_or_default().to_owned();
        let id = frame["commandId"].as_str().unwrap_or_default().to_owned();
        if tag == "command_finished" {
            assert_eq!(frame["success"], true);
        }
        order.push(format!("{tag}:{id}"));
    }

    assert_eq!(
        order,
        vec![
            "command_accepted:A".to_owned(),
            "command_started:A".to_owned(),
            "command_finished:A".to_owned(),
            "command_accepted:B".to_owned(),
            "command_started:B".to_owned(),
            "command_finished:B".to_owned(),
        ]
    );
    Ok(())
}

// -- Scenario 4: cross-lane concurrency ---------------------------------------

#[tokio::test]
async fn cross_lane_concurrency() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c1" }))
        .await?;
    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s2", "id": "c2" }))
        .await?;

    client.send(json!({
        "type": "prompt", "sessionId": "s1", "id": "slow", "message": "sleep:400",
    })).await?;
    client.send(json!({ "type": "get_state", "sessionId": "s2", "id": "quick" })).await?;

    // The s2 read returns while the s1 prompt is still running; its
    // response must arrive before the slow finish event.
    let frame = client
        .wait_for(|f| {
            (f["type"] == "response" && f["id"] == "quick")
                || (f["type"] == "command_finished" && f["commandId"] == "slow")
        })
        .await?;
    assert_eq!(frame["type"], "response", "slow prompt finished first: {frame}");
    assert_eq!(frame["success"], true);

    let slow = client.response_for("slow").await?;
    assert_eq!(slow["success"], true);
    Ok(())
}

// -- Scenario 5: optimistic concurrency ---------------------------------------

#[tokio::test]
async fn optimistic_concurrency() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c0" }))
        .await?;

    let first = client
        .round_trip(json!({
            "type": "set_model", "sessionId": "s1", "id": "m1",
            "ifSessionVersion": 0, "provider": "echo", "model": "echo-2",
        }))
        .await?;
    assert_eq!(first["success"], true);
    assert_eq!(first["sessionVersion"], 1);

    let second = client
        .round_trip(json!({
            "type": "set_model", "sessionId": "s1", "id": "m2",
            "ifSessionVersion": 0, "provider": "echo", "model": "echo-1",
        }))
        .await?;
    assert_eq!(second["success"], false);
    let error = second["error"].as_str().unwrap_or_default();
    assert!(error.contains("version mismatch"), "error was: {error}");
    Ok(())
}

// -- Scenario 6: extension UI round trip --------------------------------------

#[tokio::test]
async fn extension_ui_round_trip() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c0" }))
        .await?;
    client
        .round_trip(json!({ "type": "switch_session", "sessionId": "s1", "id": "c1" }))
        .await?;

    client.send(json!({
        "type": "prompt", "sessionId": "s1", "id": "p1", "message": "ui:select",
    })).await?;

    let request = client
        .wait_for(|f| f["type"] == "event" && f["event"]["type"] == "extension_ui_request")
        .await?;
    assert_eq!(request["event"]["method"], "select");
    let request_id = request["event"]["requestId"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing requestId"))?
        .to_owned();

    // A malformed requestId is rejected without touching the pending
    // request.
    let malformed = client
        .round_trip(json!({
            "type": "extension_ui_response", "sessionId": "s1",
            "id": "bad", "requestId": "not ok!",
        }))
        .await?;
    assert_eq!(malformed["success"], false);

    let resolved = client
        .round_trip(json!({
            "type": "extension_ui_response", "sessionId": "s1",
            "id": "ok", "requestId": request_id, "value": "beta",
        }))
        .await?;
    assert_eq!(resolved["success"], true);

    let prompt = client.response_for("p1").await?;
    assert_eq!(prompt["success"], true);
    assert_eq!(prompt["data"]["selected"], "beta");
    Ok(())
}

// -- Structural rejections ----------------------------------------------------

#[tokio::test]
async fn structural_rejections_have_no_lifecycle() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    // Unknown command type.
    client.send(json!({ "type": "frobnicate", "id": "x1" })).await?;
    let resp = client.wait_for(|f| f["type"] == "response").await?;
    assert_eq!(resp["success"], false);
    assert!(resp["error"].as_str().unwrap_or_default().contains("unknown command"));

    // Reserved synthetic prefix.
    client
        .send(json!({ "type": "get_state", "sessionId": "s1", "id": "anon:1" }))
        .await?;
    let resp = client.wait_for(|f| f["type"] == "response").await?;
    assert_eq!(resp["success"], false);

    // Malformed sessionId.
    client.send(json!({ "type": "get_state", "sessionId": "../etc" })).await?;
    let resp = client.wait_for(|f| f["type"] == "response").await?;
    assert_eq!(resp["success"], false);

    // A well-formed command still works afterwards; no lifecycle noise
    // leaked from the rejections.
    let health = client.round_trip(json!({ "type": "health_check", "id": "h1" })).await?;
    assert_eq!(health["success"], true);
    assert_eq!(health["data"]["status"], "running");
    Ok(())
}

// -- Session registry over the wire -------------------------------------------

#[tokio::test]
async fn list_and_delete_sessions() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "a", "id": "c1" }))
        .await?;
    client
        .round_trip(json!({ "type": "create_session", "sessionId": "b", "id": "c2" }))
        .await?;

    let listed = client.round_trip(json!({ "type": "list_sessions", "id": "l1" })).await?;
    let sessions = listed["data"]["sessions"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("missing sessions"))?;
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["sessionId"], "a");
    assert_eq!(sessions[1]["sessionId"], "b");

    let deleted = client
        .round_trip(json!({ "type": "delete_session", "sessionId": "a", "id": "d1" }))
        .await?;
    assert_eq!(deleted["success"], true);
    client
        .wait_for(|f| f["type"] == "session_deleted" && f["sessionId"] == "a")
        .await?;

    let relisted = client.round_trip(json!({ "type": "list_sessions", "id": "l2" })).await?;
    let sessions = relisted["data"]["sessions"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("missing sessions"))?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], "b");

    // Commands against the deleted session fail cleanly.
    let stale = client
        .round_trip(json!({ "type": "get_state", "sessionId": "a", "id": "g1" }))
        .await?;
    assert_eq!(stale["success"], false);
    Ok(())
}

// -- Metrics surface ----------------------------------------------------------

#[tokio::test]
async fn metrics_report_replays_and_breakers() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let mut client = server.client().await?;

    client
        .round_trip(json!({ "type": "create_session", "sessionId": "s1", "id": "c0" }))
        .await?;
    let frame = json!({ "type": "get_state", "sessionId": "s1", "id": "g1" });
    client.round_trip(frame.clone()).await?;
    client.round_trip(frame).await?;

    let metrics = client.round_trip(json!({ "type": "get_metrics", "id": "m1" })).await?;
    assert_eq!(metrics["success"], true);
    let counters = &metrics["data"]["metrics"]["counters"];
    assert_eq!(counters["replaysServed"], 1);
    assert!(counters["commandsAdmitted"].as_u64().unwrap_or_default() >= 2);
    assert!(metrics["data"]["metrics"]["breakers"]["bashGlobal"]["state"].is_string());
    assert!(metrics["data"]["metrics"]["replay"]["storedOutcomes"].as_u64().is_some());
    Ok(())
}
