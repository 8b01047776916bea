mod common;

use common::*;
use jarvis_contracts::{
    AgentMode, AuditDecision, EventEnvelope, PermissionDecision, PermissionReply, RunCardStatus,
    SidecarName, ToolResult,
};
use jarvis_host::scenarios::{chunk_text, find_scenario};
use jarvis_host::session::{SessionUpdate, TurnOutcome, TurnPhase};
use serde_json::json;

const DENIED: &str = " I skipped that action because you denied permission.";

fn reply(request_id: &str, decision: PermissionDecision) -> PermissionReply {
    PermissionReply {
        request_id: request_id.to_string(),
        decision,
    }
}

fn text_before_prompt(scenario_id: &str) -> String {
    let scenario = find_scenario(scenario_id).expect("scenario");
    let trigger = scenario.permission_trigger_chunk.expect("trigger");
    chunk_text(scenario.assistant_text)[..=trigger].concat()
}

#[tokio::test]
async fn allowed_fix_tests_turn_runs_to_success() {
    let (session, link) = scripted_session("code-fix-tests", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Fix the failing tests"))
        .expect("turn starts");

    let (mut seen, prompt) = until_prompt(&mut updates).await;
    assert_eq!(session.phase(), TurnPhase::AwaitingApproval);
    assert_eq!(prompt.tool.name, "shell.exec");
    assert_eq!(
        session.snapshot().messages[1].text,
        text_before_prompt("code-fix-tests")
    );

    let allow = reply(&prompt.request_id, PermissionDecision::AllowOnce);
    assert!(session.reply_permission(&allow));
    seen.extend(until_finished(&mut updates).await);
    assert_eq!(handle.finished().await, TurnOutcome::Completed);

    assert_eq!(
        card_statuses(&seen, "run_fix_tests-1"),
        vec![
            RunCardStatus::Running,
            RunCardStatus::PendingApproval,
            RunCardStatus::Running,
            RunCardStatus::Success,
        ]
    );

    let entries = session.audit().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, AuditDecision::AllowOnce);
    assert_eq!(entries[0].tool_name, "shell.exec");
    assert_eq!(entries[0].agent, AgentMode::Code);
    assert_eq!(
        entries[0].parameters.as_ref().and_then(|params| params.get("command")),
        Some(&json!("pnpm test"))
    );

    // The audit entry for the decision is published before the card resumes.
    let audited = position(&seen, |update| {
        matches!(update, SessionUpdate::Event(EventEnvelope::AuditAppended(_)))
    });
    let pending = position(&seen, |update| {
        matches!(update, SessionUpdate::Event(EventEnvelope::RunCard(payload)) if payload.run.status == RunCardStatus::PendingApproval)
    });
    let resumed = pending
        + 1
        + position(&seen[pending + 1..], |update| {
            matches!(update, SessionUpdate::Event(EventEnvelope::RunCard(payload)) if payload.run.status == RunCardStatus::Running)
        });
    assert!(audited < resumed);

    let snapshot = session.snapshot();
    let scenario = find_scenario("code-fix-tests").expect("scenario");
    assert_eq!(snapshot.phase, TurnPhase::Idle);
    assert_eq!(snapshot.messages[1].text, scenario.assistant_text);
    assert!(snapshot.pending_prompt.is_none());
    assert_eq!(link.replies(), vec![allow]);
}

#[tokio::test]
async fn denied_fix_tests_turn_cancels_the_card() {
    let (session, link) = scripted_session("code-fix-tests", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Fix the failing tests"))
        .expect("turn starts");

    let (mut seen, prompt) = until_prompt(&mut updates).await;
    assert!(session.reply_permission(&reply(&prompt.request_id, PermissionDecision::Deny)));
    seen.extend(until_finished(&mut updates).await);
    assert_eq!(handle.finished().await, TurnOutcome::Denied);

    assert_eq!(
        card_statuses(&seen, "run_fix_tests-1"),
        vec![
            RunCardStatus::Running,
            RunCardStatus::PendingApproval,
            RunCardStatus::Cancelled,
        ]
    );
    let snapshot = session.snapshot();
    assert_eq!(
        snapshot.messages[1].text,
        format!("{}{DENIED}", text_before_prompt("code-fix-tests"))
    );

    let entries = session.audit().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, AuditDecision::Deny);
    assert!(entries[0].error.is_none());
    assert_eq!(link.replies().len(), 1);
}

#[tokio::test]
async fn stale_replies_change_nothing() {
    let (session, _link) = scripted_session("general-day-plan", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::General, "Plan my day"))
        .expect("turn starts");

    let (_, prompt) = until_prompt(&mut updates).await;
    let before = session.snapshot();
    assert!(!session.reply_permission(&reply("perm_other", PermissionDecision::AllowOnce)));
    let after = session.snapshot();
    assert_eq!(after.phase, TurnPhase::AwaitingApproval);
    assert_eq!(after.messages, before.messages);
    assert!(session.audit().is_empty());

    assert!(session.reply_permission(&reply(&prompt.request_id, PermissionDecision::Deny)));
    assert_eq!(handle.finished().await, TurnOutcome::Denied);

    // A duplicate of an answered reply is stale as well.
    assert!(!session.reply_permission(&reply(&prompt.request_id, PermissionDecision::AllowOnce)));
    assert_eq!(session.audit().len(), 1);
    assert_eq!(session.phase(), TurnPhase::Idle);
}

#[tokio::test]
async fn safe_tools_are_audited_without_a_prompt() {
    let (session, _link) = scripted_session("general-brief", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::General, "Summarize"))
        .expect("turn starts");

    let seen = until_finished(&mut updates).await;
    assert_eq!(handle.finished().await, TurnOutcome::Completed);
    assert!(!seen.iter().any(|update| matches!(
        update,
        SessionUpdate::Event(EventEnvelope::PermissionRequested(_))
    )));

    let entries = session.audit().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, AuditDecision::Auto);
    assert_eq!(entries[0].tool_name, "notes.search");

    let snapshot = session.snapshot();
    assert_eq!(snapshot.sidecars.len(), 1);
    assert_eq!(snapshot.sidecars[0].name, SidecarName::GeneralAgent);
    assert!(snapshot.sidecars[0].healthy);
    assert!(snapshot.run_cards.is_empty());
}

#[tokio::test]
async fn unanswered_prompt_times_out_as_deny() {
    let config = test_config()
        .with_permission_timeout(Some(std::time::Duration::from_millis(50)));
    let (session, link) = scripted_session("code-fix-tests", config);
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Fix the failing tests"))
        .expect("turn starts");

    assert_eq!(handle.finished().await, TurnOutcome::Denied);

    let entries = session.audit().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, AuditDecision::Deny);
    assert_eq!(
        entries[0].error.as_ref().and_then(|error| error.get("code")),
        Some(&json!("permission_timeout"))
    );
    let replies = link.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].decision, PermissionDecision::Deny);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.run_cards[0].status, RunCardStatus::Cancelled);
    assert!(snapshot.messages[1].text.ends_with("timed out."));
}

#[tokio::test]
async fn cancel_releases_the_pending_prompt() {
    let (session, _link) = scripted_session("code-fix-tests", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Fix the failing tests"))
        .expect("turn starts");

    let (_, prompt) = until_prompt(&mut updates).await;
    assert_eq!(session.cancel().expect("cancellable"), handle.turn_id);
    assert_eq!(handle.finished().await, TurnOutcome::Cancelled);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, TurnPhase::Idle);
    assert!(snapshot.pending_prompt.is_none());
    assert_eq!(snapshot.run_cards[0].status, RunCardStatus::Cancelled);

    let entries = session.audit().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, AuditDecision::Deny);
    assert_eq!(
        entries[0].error.as_ref().and_then(|error| error.get("code")),
        Some(&json!("turn_cancelled"))
    );
    assert!(!session.reply_permission(&reply(&prompt.request_id, PermissionDecision::AllowOnce)));
}

#[tokio::test]
async fn tool_results_correlate_with_allowed_calls() {
    let (session, _link) = scripted_session("code-fix-tests", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Fix the failing tests"))
        .expect("turn starts");

    let (_, prompt) = until_prompt(&mut updates).await;
    session.reply_permission(&reply(&prompt.request_id, PermissionDecision::AllowOnce));
    assert_eq!(handle.finished().await, TurnOutcome::Completed);

    let result = ToolResult {
        id: prompt.tool.id.clone(),
        ok: true,
        result: Some(json!({ "exit_code": 0 })),
        error: None,
    };
    assert!(!session.record_tool_result(ToolResult {
        id: "tool_unknown".to_string(),
        ..result.clone()
    }));
    assert!(session.record_tool_result(result.clone()));
    assert!(!session.record_tool_result(result));

    let entries = session.audit().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].decision, AuditDecision::AllowOnce);
    assert_eq!(entries[1].result, Some(json!({ "exit_code": 0 })));

    // A second turn in the same session gets its own card.
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Again"))
        .expect("second turn starts");
    let (_, prompt) = until_prompt(&mut updates).await;
    session.reply_permission(&reply(&prompt.request_id, PermissionDecision::AllowOnce));
    assert_eq!(handle.finished().await, TurnOutcome::Completed);
    let cards = session.snapshot().run_cards;
    assert_eq!(cards.len(), 2);
    assert_eq!(cards[1].run_id, "run_fix_tests-2");
}

#[tokio::test]
async fn unreported_tool_results_expire_with_the_next_turn() {
    let (session, _link) = scripted_session("code-fix-tests", test_config());
    let mut updates = session.subscribe();
    let handle = session
        .send_chat_message(request(AgentMode::Code, "Fix the failing tests"))
        .expect("turn starts");
    let (_, first) = until_prompt(&mut updates).await;
    session.reply_permission(&reply(&first.request_id, PermissionDecision::AllowOnce));
    assert_eq!(handle.finished().await, TurnOutcome::Completed);

    let handle = session
        .send_chat_message(request(AgentMode::Code, "Again"))
        .expect("second turn starts");
    let (_, second) = until_prompt(&mut updates).await;
    session.reply_permission(&reply(&second.request_id, PermissionDecision::Deny));
    assert_eq!(handle.finished().await, TurnOutcome::Denied);

    assert!(!session.record_tool_result(ToolResult {
        id: first.tool.id,
        ok: true,
        result: Some(json!({ "exit_code": 0 })),
        error: None,
    }));
    assert_eq!(session.audit().len(), 2);
}
