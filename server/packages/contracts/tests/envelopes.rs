use jarvis_contracts::{
    AgentMode, CommandEnvelope, EventEnvelope, PermissionDecision, ProtocolError, RiskLevel,
    RunCardStatus,
};
use serde_json::json;

#[test]
fn send_chat_message_parses_with_optional_fields_omitted() {
    let command = CommandEnvelope::from_value(json!({
        "command": "send_chat_message",
        "args": { "mode": "code", "text": "fix tests" }
    }))
    .expect("valid command");

    match command {
        CommandEnvelope::SendChatMessage(request) => {
            assert_eq!(request.mode, AgentMode::Code);
            assert_eq!(request.text, "fix tests");
            assert_eq!(request.repo_path, None);
            assert_eq!(request.conversation_id, None);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn reply_permission_rejects_unknown_decision() {
    let err = CommandEnvelope::from_value(json!({
        "command": "reply_permission",
        "args": { "request_id": "perm-1", "decision": "allow_always" }
    }))
    .expect_err("decision outside allow_once|deny");

    assert!(matches!(
        err,
        ProtocolError::InvalidPayload { ref tag, .. } if tag == "reply_permission"
    ));
}

#[test]
fn reply_permission_accepts_known_decisions() {
    let command = CommandEnvelope::from_json(
        r#"{"command":"reply_permission","args":{"request_id":"perm-1","decision":"deny"}}"#,
    )
    .expect("valid reply");
    let CommandEnvelope::ReplyPermission(reply) = command else {
        panic!("expected reply_permission");
    };
    assert_eq!(reply.decision, PermissionDecision::Deny);
}

#[test]
fn unknown_and_missing_tags_are_distinguished() {
    let unknown = EventEnvelope::from_value(json!({ "event": "chat.bogus", "payload": {} }))
        .expect_err("unknown tag");
    assert_eq!(
        unknown,
        ProtocolError::UnknownTag {
            field: "event",
            tag: "chat.bogus".to_string()
        }
    );

    let missing = EventEnvelope::from_value(json!({ "payload": {} })).expect_err("missing tag");
    assert_eq!(missing, ProtocolError::MissingTag { field: "event" });

    let not_an_object = CommandEnvelope::from_value(json!("send_chat_message"))
        .expect_err("scalar envelope");
    assert_eq!(not_an_object, ProtocolError::MissingTag { field: "command" });
}

#[test]
fn optional_fields_must_not_carry_invalid_types() {
    let err = EventEnvelope::from_value(json!({
        "event": "sidecar.status",
        "payload": { "status": { "name": "opencode", "healthy": true, "port": "4096" } }
    }))
    .expect_err("port must be a number");
    assert!(matches!(err, ProtocolError::InvalidPayload { .. }));

    let err = EventEnvelope::from_value(json!({
        "event": "chat.delta",
        "payload": { "mode": "code", "text": "hi", "message_id": 7 }
    }))
    .expect_err("message_id must be a string");
    assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
}

#[test]
fn permission_prompt_rejects_unknown_risk() {
    let err = EventEnvelope::from_value(json!({
        "event": "permission.requested",
        "payload": {
            "prompt": {
                "request_id": "perm-1",
                "source": "opencode",
                "tool": { "id": "t1", "name": "shell", "arguments": {}, "risk": "spicy" }
            }
        }
    }))
    .expect_err("risk outside safe|risky|forbidden");
    assert!(matches!(
        err,
        ProtocolError::InvalidPayload { ref tag, .. } if tag == "permission.requested"
    ));
}

#[test]
fn run_card_and_audit_events_parse() {
    let event = EventEnvelope::from_value(json!({
        "event": "run.card",
        "payload": {
            "mode": "code",
            "run": {
                "run_id": "run_fix_tests",
                "kind": "command",
                "status": "pending_approval",
                "title": "Run tests",
                "meta": { "cwd": "/repo" }
            }
        }
    }))
    .expect("run card");
    let EventEnvelope::RunCard(payload) = event else {
        panic!("expected run.card");
    };
    assert_eq!(payload.run.status, RunCardStatus::PendingApproval);
    assert!(payload.run.meta.is_some());

    let event = EventEnvelope::from_value(json!({
        "event": "audit.appended",
        "payload": {
            "entry": {
                "timestamp": "2026-01-01T00:00:00Z",
                "tool_name": "shell.exec",
                "agent": "code",
                "risk": "risky",
                "decision": "allow_once",
                "parameters": { "command": "pnpm test" }
            }
        }
    }))
    .expect("audit entry");
    let EventEnvelope::AuditAppended(payload) = event else {
        panic!("expected audit.appended");
    };
    assert_eq!(payload.entry.risk, RiskLevel::Risky);
}

#[test]
fn chat_delta_serializes_with_adjacent_tag() {
    let event = EventEnvelope::chat_delta(AgentMode::Code, "Hi");
    insta::assert_json_snapshot!(event, @r#"
    {
      "event": "chat.delta",
      "payload": {
        "mode": "code",
        "text": "Hi"
      }
    }
    "#);
    assert_eq!(EventEnvelope::from_value(event.to_value()), Ok(event));
}

#[test]
fn schemas_name_every_tag() {
    let command = serde_json::to_string(&jarvis_contracts::command_schema()).expect("schema");
    for tag in CommandEnvelope::TAGS {
        assert!(command.contains(tag), "command schema missing {tag}");
    }
    let event = serde_json::to_string(&jarvis_contracts::event_schema()).expect("schema");
    for tag in EventEnvelope::TAGS {
        assert!(event.contains(tag), "event schema missing {tag}");
    }
}
