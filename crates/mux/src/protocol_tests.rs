// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;
use serde_json::json;

use super::*;

#[test]
fn command_envelope_round_trip() -> anyhow::Result<()> {
    let frame = json!({
        "type": "prompt",
        "id": "c1",
        "sessionId": "s1",
        "dependsOn": ["a", "b"],
        "ifSessionVersion": 3,
        "idempotencyKey": "k1",
        "message": "hello",
    });
    let cmd: Command = serde_json::from_value(frame.clone())?;
    assert_eq!(cmd.id.as_deref(), Some("c1"));
    assert_eq!(cmd.session_id.as_deref(), Some("s1"));
    assert_eq!(cmd.depends_on, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(cmd.if_session_version, Some(3));
    assert_eq!(cmd.payload, CommandPayload::Prompt { message: "hello".to_owned() });

    let back = serde_json::to_value(&cmd)?;
    assert_eq!(back, frame);
    Ok(())
}

#[test]
fn unit_payloads_round_trip() -> anyhow::Result<()> {
    let frame = json!({ "type": "get_state", "sessionId": "s1" });
    let cmd: Command = serde_json::from_value(frame.clone())?;
    assert_eq!(cmd.payload, CommandPayload::GetState);
    assert_eq!(serde_json::to_value(&cmd)?, frame);
    Ok(())
}

#[test]
fn every_type_tag_is_known() -> anyhow::Result<()> {
    // Each tag in the closed list parses (with a plausible payload)
    // and names itself back.
    for tag in COMMAND_TYPES {
        let mut frame = json!({ "type": tag, "sessionId": "s1" });
        let extra = match *tag {
            "prompt" | "steer" | "follow_up" => json!({ "message": "m" }),
            "set_model" => json!({ "provider": "p", "model": "m" }),
            "set_thinking_level" => json!({ "level": "high" }),
            "set_session_name" => json!({ "name": "n" }),
            "set_auto_compaction" | "set_auto_retry" => json!({ "enabled": true }),
            "bash" => json!({ "command": "ls" }),
            "load_session" | "switch_session_file" => json!({ "path": "/tmp/x.json" }),
            "extension_ui_response" => json!({ "requestId": "r1" }),
            _ => json!({}),
        };
        if let (Some(obj), Some(extra)) = (frame.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let cmd: Command = serde_json::from_value(frame)?;
        assert_eq!(cmd.payload.name(), *tag);
    }
    Ok(())
}

#[test]
fn server_lane_partition() {
    assert!(CommandPayload::ListSessions.is_server());
    assert!(CommandPayload::CreateSession.is_server());
    assert!(CommandPayload::HealthCheck.is_server());
    assert!(CommandPayload::LoadSession { path: "/x.json".to_owned() }.is_server());
    assert!(!CommandPayload::GetState.is_server());
    assert!(!CommandPayload::Prompt { message: "m".to_owned() }.is_server());
    assert!(!CommandPayload::ExtensionUiResponse {
        request_id: "r".to_owned(),
        value: None,
        confirmed: None,
        responses: None,
        cancelled: false,
    }
    .is_server());
}

#[test]
fn lane_keys() -> anyhow::Result<()> {
    let cmd: Command =
        serde_json::from_value(json!({ "type": "get_state", "sessionId": "s1" }))?;
    assert_eq!(cmd.lane(), "session:s1");
    assert_eq!(cmd.scope(), "s1");

    let cmd: Command = serde_json::from_value(json!({ "type": "list_sessions" }))?;
    assert_eq!(cmd.lane(), "server");
    assert_eq!(cmd.scope(), "server");

    // Registry commands carry a sessionId but run on the server lane.
    let cmd: Command =
        serde_json::from_value(json!({ "type": "create_session", "sessionId": "s1" }))?;
    assert_eq!(cmd.lane(), "server");
    assert_eq!(cmd.scope(), "server");
    Ok(())
}

#[test]
fn fingerprint_ignores_retry_identity() {
    let a = json!({ "type": "prompt", "sessionId": "s1", "message": "x", "id": "c1" });
    let b = json!({
        "type": "prompt", "sessionId": "s1", "message": "x",
        "id": "c2", "idempotencyKey": "k9",
    });
    assert_eq!(fingerprint(&a), fingerprint(&b));
}

#[test]
fn fingerprint_sees_payload_changes() {
    let a = json!({ "type": "prompt", "sessionId": "s1", "message": "x" });
    let b = json!({ "type": "prompt", "sessionId": "s1", "message": "y" });
    let c = json!({ "type": "prompt", "sessionId": "s2", "message": "x" });
    assert_ne!(fingerprint(&a), fingerprint(&b));
    assert_ne!(fingerprint(&a), fingerprint(&c));
}

#[test]
fn response_serialization_is_stable() -> anyhow::Result<()> {
    let resp = Response::ok("get_state", Some("c1".to_owned()), None);
    let first = serde_json::to_string(&ServerMessage::Response(resp.clone()))?;
    let second = serde_json::to_string(&ServerMessage::Response(resp))?;
    assert_eq!(first, second);
    assert!(first.contains(r#""type":"response""#));
    assert!(first.contains(r#""command":"get_state""#));
    // Unset flags stay off the wire entirely.
    assert!(!first.contains("replayed"));
    assert!(!first.contains("timedOut"));
    Ok(())
}

#[test]
fn server_message_round_trips() -> anyhow::Result<()> {
    let messages = vec![
        ServerMessage::Event { session_id: "s1".to_owned(), event: json!({ "type": "text" }) },
        ServerMessage::CommandAccepted {
            command_id: "c1".to_owned(),
            command_type: "prompt".to_owned(),
            session_id: Some("s1".to_owned()),
        },
        ServerMessage::SessionCreated { session_id: "s1".to_owned() },
        ServerMessage::ServerShutdown,
        ServerMessage::ServerReady { data: ServerReadyData::current() },
    ];
    for msg in messages {
        let text = serde_json::to_string(&msg)?;
        let back: ServerMessage = serde_json::from_str(&text)?;
        assert_eq!(back, msg);
    }
    Ok(())
}

#[test]
fn finished_event_mirrors_response() {
    let err = crate::error::CommandError::new(crate::error::ErrorKind::Timeout, "timed out");
    let mut resp = Response::fail("prompt", Some("c1".to_owned()), &err);
    resp.timed_out = Some(true);
    let finished = CommandFinished::from_response("c1", Some("s1"), &resp);
    assert!(!finished.success);
    assert_eq!(finished.timed_out, Some(true));
    assert_eq!(finished.command_type, "prompt");
    assert_eq!(finished.session_id.as_deref(), Some("s1"));
}

proptest! {
    /// fingerprint(c) == fingerprint(c with id/idempotencyKey changed), for all c.
    #[test]
    fn fingerprint_law(
        message in ".*",
        session in "[A-Za-z0-9._-]{1,16}",
        id_a in "[a-z0-9]{1,12}",
        id_b in "[a-z0-9]{1,12}",
        key in proptest::option::of("[a-z0-9]{1,12}"),
    ) {
        let mut a = json!({ "type": "prompt", "sessionId": session, "message": message });
        let mut b = a.clone();
        if let Some(obj) = a.as_object_mut() {
            obj.insert("id".to_owned(), json!(id_a));
        }
        if let Some(obj) = b.as_object_mut() {
            obj.insert("id".to_owned(), json!(id_b));
            if let Some(ref key) = key {
                obj.insert("idempotencyKey".to_owned(), json!(key));
            }
        }
        prop_assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    /// Any message change breaks fingerprint equivalence.
    #[test]
    fn fingerprint_distinguishes(message in "[a-z]{1,20}") {
        let a = json!({ "type": "prompt", "sessionId": "s1", "message": message.clone() });
        let b = json!({
            "type": "prompt", "sessionId": "s1",
            "message": format!("{message}!"),
        });
        prop_assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
