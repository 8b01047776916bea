use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::{stream, StreamExt};
use jarvis_contracts::{
    AgentMode, AuditDecision, AuditEntry, ChatRequest, EventEnvelope, PermissionPrompt, PermissionReply,
    PromptUi, RunCard, RunCardStatus, SidecarStatus, ToolCall,
};
use serde_json::{Map, Value};

use super::{AgentLink, EventStream, TurnKey};
use crate::audit::now_timestamp;
use crate::scenarios::{chunk_text, DemoScenario};

/// Replays a demo scenario as if a sidecar were streaming it.
#[derive(Debug)]
pub struct ScriptedLink {
    scenario: DemoScenario,
    chunk_delay: Duration,
    turn_counter: AtomicU64,
    replies: Mutex<Vec<PermissionReply>>,
}

impl ScriptedLink {
    pub fn new(scenario: DemoScenario, chunk_delay: Duration) -> Self {
        Self {
            scenario,
            chunk_delay,
            turn_counter: AtomicU64::new(0),
            replies: Mutex::new(Vec::new()),
        }
    }

    /// Decisions forwarded by the session, in order.
    pub fn replies(&self) -> Vec<PermissionReply> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn script(&self, request: &ChatRequest, turn: u64) -> Vec<EventEnvelope> {
        let scenario = &self.scenario;
        let mode = request.mode;
        let mut events = vec![EventEnvelope::sidecar_status(SidecarStatus {
            name: mode.sidecar(),
            healthy: true,
            detail: Some(format!("scripted: {}", scenario.id)),
            port: None,
        })];

        let code_card = match mode {
            AgentMode::Code => scenario.run_card.as_ref(),
            AgentMode::General => None,
        };
        if let Some(card) = code_card {
            let mut meta = Map::new();
            meta.insert("scenario".to_string(), Value::from(scenario.id));
            events.push(EventEnvelope::run_card(
                mode,
                RunCard {
                    run_id: format!("{}-{turn}", card.run_id),
                    kind: card.kind,
                    status: RunCardStatus::Running,
                    title: card.title.to_string(),
                    summary: Some(card.summary.to_string()),
                    detail: None,
                    meta: Some(meta),
                },
            ));
        }

        if let Some(tool) = &scenario.auto_tool {
            events.push(EventEnvelope::audit_appended(AuditEntry {
                timestamp: now_timestamp(),
                tool_name: tool.name.to_string(),
                agent: mode,
                risk: tool.risk,
                decision: AuditDecision::Auto,
                parameters: Some(tool.argument_map()),
                result: None,
                error: None,
            }));
        }

        for (index, chunk) in chunk_text(scenario.assistant_text).into_iter().enumerate() {
            events.push(EventEnvelope::chat_delta(mode, chunk));
            if scenario.permission_trigger_chunk != Some(index) {
                continue;
            }
            if let Some(tool) = &scenario.tool {
                events.push(EventEnvelope::permission_requested(PermissionPrompt {
                    request_id: format!("perm_{}_{turn}", scenario.id),
                    source: mode.prompt_source(),
                    tool: ToolCall {
                        id: format!("tool_{}_{turn}", scenario.id),
                        name: tool.name.to_string(),
                        arguments: tool.argument_map(),
                        risk: tool.risk,
                        reason: Some(tool.reason.to_string()),
                    },
                    ui: Some(PromptUi {
                        title: Some("Action Requires Approval".to_string()),
                        summary: Some(tool.name.to_string()),
                        detail: Some(tool.reason.to_string()),
                    }),
                }));
            }
        }

        events.push(EventEnvelope::chat_final(mode, scenario.assistant_text));
        events
    }
}

impl AgentLink for ScriptedLink {
    fn open_turn(&self, _turn: &TurnKey, request: &ChatRequest) -> EventStream {
        let turn = self.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.script(request, turn);
        tracing::debug!(
            scenario = self.scenario.id,
            turn,
            events = events.len(),
            "opening scripted turn"
        );
        let delay = self.chunk_delay;
        stream::iter(events)
            .then(move |event| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                event.to_value()
            })
            .boxed()
    }

    fn forward_reply(&self, _turn: &TurnKey, reply: &PermissionReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reply.clone());
    }
}
