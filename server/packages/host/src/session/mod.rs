//! Per-conversation orchestration of turns.
//!
//! Every mutation happens under the session lock in one synchronous step, so an observer never
//! sees a half-applied event. The only suspension point is the permission broker wait inside the
//! turn driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jarvis_contracts::{
    AgentMode, AuditDecision, AuditEntry, ChatRequest, ChatTextPayload, CommandEnvelope,
    EventEnvelope, PermissionDecision, PermissionPrompt, PermissionReply, ProtocolError, RiskLevel,
    RunCard, RunCardPayload, RunCardStatus, SidecarName, SidecarStatus, ToolResult,
};
use jarvis_error::{Notice, SessionError};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::agent_link::{AgentDirectory, AgentLink, TurnKey};
use crate::audit::{now_timestamp, AuditRecorder};
use crate::broker::{DecisionWaiter, PermissionBroker, Resolution, ResolutionReason};
use crate::config::HostConfig;
use crate::health::SidecarHealth;

mod driver;
mod run_cards;

pub use self::run_cards::{CardChange, RunCardBoard};

pub type TurnId = u64;

const DENIED_NOTE: &str = " I skipped that action because you denied permission.";
const TIMED_OUT_NOTE: &str = " I skipped that action because the approval request timed out.";
const ABORTED_NOTE: &str = " I stopped this turn because the agent sent an invalid update.";
const MAX_NOTICES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Dispatched,
    Streaming,
    AwaitingApproval,
}

impl TurnPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dispatched => "dispatched",
            Self::Streaming => "streaming",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Denied,
    Cancelled,
    Failed { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnFinished {
    pub turn_id: TurnId,
    #[serde(flatten)]
    pub outcome: TurnOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
}

/// Published to the UI after every visible state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionUpdate {
    Event(EventEnvelope),
    Notice(Notice),
    TurnFinished(TurnFinished),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub mode: AgentMode,
    pub phase: TurnPhase,
    pub messages: Vec<Message>,
    pub run_cards: Vec<RunCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_prompt: Option<PermissionPrompt>,
    pub sidecars: Vec<SidecarStatus>,
    pub notices: Vec<Notice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<TurnFinished>,
}

#[derive(Debug)]
pub enum CommandOutcome {
    TurnStarted(TurnHandle),
    ModeSwitched(AgentMode),
    PermissionReplied { matched: bool },
}

/// Completion handle for a spawned turn.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: TurnId,
    join: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub async fn finished(self) -> TurnOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(turn_id = self.turn_id, error = %err, "turn driver failed");
                TurnOutcome::Failed {
                    detail: err.to_string(),
                }
            }
        }
    }
}

pub(crate) enum Step {
    Continue,
    Suspend(DecisionWaiter),
    Finished(TurnOutcome),
    Stale,
}

#[derive(Debug)]
struct ActiveTurn {
    id: TurnId,
    key: TurnKey,
    mode: AgentMode,
    conversation_id: Option<String>,
    assistant_index: usize,
    run_ids: Vec<String>,
    final_received: bool,
    link: Arc<dyn AgentLink>,
    done: watch::Sender<Option<TurnOutcome>>,
}

#[derive(Debug, Clone)]
struct AllowedTool {
    name: String,
    agent: AgentMode,
    risk: RiskLevel,
    arguments: Map<String, Value>,
}

#[derive(Debug)]
struct SessionState {
    mode: AgentMode,
    phase: TurnPhase,
    messages: Vec<Message>,
    run_cards: RunCardBoard,
    broker: PermissionBroker,
    turn: Option<ActiveTurn>,
    next_turn_id: TurnId,
    next_message_id: u64,
    sidecars: HashMap<SidecarName, SidecarStatus>,
    notices: Vec<Notice>,
    last_outcome: Option<TurnFinished>,
    allowed_tools: HashMap<String, AllowedTool>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    agents: AgentDirectory,
    audit: Arc<AuditRecorder>,
    health: Arc<SidecarHealth>,
    permission_timeout: Option<Duration>,
    updates: broadcast::Sender<SessionUpdate>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        agents: AgentDirectory,
        audit: Arc<AuditRecorder>,
        config: &HostConfig,
    ) -> Arc<Self> {
        Self::with_health(id, agents, audit, Arc::new(SidecarHealth::new()), config)
    }

    /// Like [`Session::new`], reporting sidecar health into a board shared with other sessions.
    pub fn with_health(
        id: impl Into<String>,
        agents: AgentDirectory,
        audit: Arc<AuditRecorder>,
        health: Arc<SidecarHealth>,
        config: &HostConfig,
    ) -> Arc<Self> {
        let (updates, _rx) = broadcast::channel(config.update_capacity.max(1));
        let state = SessionState {
            mode: AgentMode::General,
            phase: TurnPhase::Idle,
            messages: Vec::new(),
            run_cards: RunCardBoard::default(),
            broker: PermissionBroker::new(updates.clone()),
            turn: None,
            next_turn_id: 1,
            next_message_id: 1,
            sidecars: HashMap::new(),
            notices: Vec::new(),
            last_outcome: None,
            allowed_tools: HashMap::new(),
        };
        Arc::new(Self {
            id: id.into(),
            agents,
            audit,
            health,
            permission_timeout: config.permission_timeout,
            updates,
            state: Mutex::new(state),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn audit(&self) -> &Arc<AuditRecorder> {
        &self.audit
    }

    pub fn phase(&self) -> TurnPhase {
        self.lock().phase
    }

    pub fn mode(&self) -> AgentMode {
        self.lock().mode
    }

    pub fn pending_prompt(&self) -> Option<PermissionPrompt> {
        self.lock().broker.pending().cloned()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        let mut sidecars: Vec<SidecarStatus> = state.sidecars.values().cloned().collect();
        sidecars.sort_by_key(|status| status.name.as_str());
        SessionSnapshot {
            session_id: self.id.clone(),
            mode: state.mode,
            phase: state.phase,
            messages: state.messages.clone(),
            run_cards: state.run_cards.cards(),
            pending_prompt: state.broker.pending().cloned(),
            sidecars,
            notices: state.notices.clone(),
            last_outcome: state.last_outcome.clone(),
        }
    }

    /// Validates a raw command envelope and applies it.
    pub fn handle_raw_command(self: &Arc<Self>, raw: Value) -> Result<CommandOutcome, SessionError> {
        match CommandEnvelope::from_value(raw) {
            Ok(command) => self.handle_command(command),
            Err(err) => {
                self.report(Notice::from(&err));
                Err(err.into())
            }
        }
    }

    /// Surfaces a notice that did not come from this session's own turn.
    pub fn report(&self, notice: Notice) {
        let mut state = self.lock();
        self.push_notice(&mut state, notice);
    }

    pub fn handle_command(
        self: &Arc<Self>,
        command: CommandEnvelope,
    ) -> Result<CommandOutcome, SessionError> {
        match command {
            CommandEnvelope::SendChatMessage(request) => {
                self.send_chat_message(request).map(CommandOutcome::TurnStarted)
            }
            CommandEnvelope::SwitchMode(args) => {
                self.switch_mode(args.mode)?;
                Ok(CommandOutcome::ModeSwitched(args.mode))
            }
            CommandEnvelope::ReplyPermission(reply) => Ok(CommandOutcome::PermissionReplied {
                matched: self.reply_permission(&reply),
            }),
        }
    }

    /// Starts a turn and spawns its driver. Rejected while another turn is in flight.
    pub fn send_chat_message(
        self: &Arc<Self>,
        request: ChatRequest,
    ) -> Result<TurnHandle, SessionError> {
        let (turn_id, events, done) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.turn.is_some() {
                let err = SessionError::TurnInProgress {
                    session_id: self.id.clone(),
                };
                self.push_notice(state, err.to_notice());
                return Err(err);
            }

            let turn_id = state.next_turn_id;
            state.next_turn_id += 1;
            if !state.allowed_tools.is_empty() {
                tracing::debug!(
                    session_id = %self.id,
                    dropped = state.allowed_tools.len(),
                    "dropping unreported tool results from the previous turn"
                );
                state.allowed_tools.clear();
            }
            let message_seq = state.next_message_id;
            state.next_message_id += 1;

            state.mode = request.mode;
            state.messages.push(Message {
                id: format!("u-{message_seq}"),
                role: Role::User,
                text: request.text.clone(),
            });
            state.messages.push(Message {
                id: format!("a-{message_seq}"),
                role: Role::Assistant,
                text: String::new(),
            });

            let key = TurnKey {
                session_id: self.id.clone(),
                turn_id,
            };
            let link = self.agents.for_mode(request.mode);
            let events = link.open_turn(&key, &request);
            let (done, done_rx) = watch::channel(None);
            state.turn = Some(ActiveTurn {
                id: turn_id,
                key,
                mode: request.mode,
                conversation_id: request.conversation_id.clone(),
                assistant_index: state.messages.len() - 1,
                run_ids: Vec::new(),
                final_received: false,
                link,
                done,
            });
            state.phase = TurnPhase::Dispatched;
            tracing::info!(
                session_id = %self.id,
                turn_id,
                mode = %request.mode,
                "turn dispatched"
            );
            (turn_id, events, done_rx)
        };

        let join = tokio::spawn(self.clone().drive_turn(turn_id, events, done));
        Ok(TurnHandle { turn_id, join })
    }

    /// Mode switches are only accepted between turns.
    pub fn switch_mode(&self, mode: AgentMode) -> Result<(), SessionError> {
        let mut state = self.lock();
        if state.turn.is_some() {
            let err = SessionError::TurnInProgress {
                session_id: self.id.clone(),
            };
            self.push_notice(&mut state, err.to_notice());
            return Err(err);
        }
        state.mode = mode;
        tracing::info!(session_id = %self.id, mode = %mode, "mode switched");
        Ok(())
    }

    /// Delivers a user decision. Returns false for stale or unknown request ids.
    pub fn reply_permission(&self, reply: &PermissionReply) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some((prompt, resolution)) = state.broker.resolve(reply) else {
            return false;
        };
        self.settle_decision(state, prompt, resolution);
        true
    }

    /// Cancels the active turn. Only a streaming or suspended turn can be cancelled.
    pub fn cancel(&self) -> Result<TurnId, SessionError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !matches!(
            state.phase,
            TurnPhase::Streaming | TurnPhase::AwaitingApproval
        ) {
            return Err(SessionError::NotCancellable {
                session_id: self.id.clone(),
                phase: state.phase.as_str().to_string(),
            });
        }
        let Some(turn_id) = state.turn.as_ref().map(|turn| turn.id) else {
            return Err(SessionError::NoActiveTurn {
                session_id: self.id.clone(),
            });
        };

        self.release_prompt(state, ResolutionReason::Cancelled);
        self.move_turn_cards(
            state,
            |status| !status.is_terminal(),
            RunCardStatus::Cancelled,
        );
        tracing::info!(session_id = %self.id, turn_id, "turn cancelled");
        self.finish_turn(state, TurnOutcome::Cancelled);
        Ok(turn_id)
    }

    /// Accepts an event that arrived outside a turn stream, such as a health push.
    pub fn deliver_event(&self, raw: Value) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let event = match EventEnvelope::from_value(raw) {
            Ok(event) => event,
            Err(err) => {
                self.reject(state, err.clone());
                return Err(err.into());
            }
        };

        if event.is_turn_scoped() {
            let tag = event.tag().to_string();
            let err = if state.turn.is_some() {
                ProtocolError::TurnEventOutOfBand { tag }
            } else {
                ProtocolError::NoActiveTurn { tag }
            };
            self.reject(state, err.clone());
            return Err(err.into());
        }

        match event {
            EventEnvelope::SidecarStatus(payload) => self.record_sidecar(state, payload.status),
            EventEnvelope::AuditAppended(payload) => self.append_audit(payload.entry),
            _ => {}
        }
        Ok(())
    }

    /// Records the outcome of a tool the user allowed. Each allowed call reports once; any
    /// other id is discarded.
    pub fn record_tool_result(&self, result: ToolResult) -> bool {
        let Some(allowed) = self.lock().allowed_tools.remove(&result.id) else {
            tracing::debug!(session_id = %self.id, tool_id = %result.id, "discarding stale tool result");
            return false;
        };
        let error = result
            .error
            .map(|error| serde_json::to_value(error).unwrap_or(Value::Null));
        self.append_audit(AuditEntry {
            timestamp: now_timestamp(),
            tool_name: allowed.name,
            agent: allowed.agent,
            risk: allowed.risk,
            decision: AuditDecision::AllowOnce,
            parameters: Some(allowed.arguments),
            result: result.result,
            error,
        });
        true
    }

    pub(crate) fn apply_turn_event(&self, turn_id: TurnId, raw: Value) -> Step {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !is_current(state, turn_id) {
            return Step::Stale;
        }
        let applied =
            EventEnvelope::from_value(raw).and_then(|event| self.apply_in_turn(state, event));
        match applied {
            Ok(step) => step,
            Err(err) => Step::Finished(self.fail_turn(state, err)),
        }
    }

    pub(crate) fn complete_turn(&self, turn_id: TurnId) -> Step {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !is_current(state, turn_id) {
            return Step::Stale;
        }
        self.move_turn_cards(
            state,
            |status| !status.is_terminal(),
            RunCardStatus::Success,
        );
        tracing::info!(session_id = %self.id, turn_id, "turn completed");
        Step::Finished(self.finish_turn(state, TurnOutcome::Completed))
    }

    /// Denies `request_id` locally when its approval window elapsed.
    pub(crate) fn expire_prompt(&self, turn_id: TurnId, request_id: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !is_current(state, turn_id) || state.broker.pending_id() != Some(request_id) {
            return;
        }
        tracing::warn!(session_id = %self.id, turn_id, request_id, "permission request timed out");
        if let Some((prompt, resolution)) = state.broker.release(ResolutionReason::Timeout) {
            self.settle_decision(state, prompt, resolution);
        }
    }

    fn apply_in_turn(
        &self,
        state: &mut SessionState,
        event: EventEnvelope,
    ) -> Result<Step, ProtocolError> {
        let Some(turn) = state.turn.as_mut() else {
            return Ok(Step::Stale);
        };
        let tag = event.tag();

        match event {
            EventEnvelope::SidecarStatus(payload) => {
                self.record_sidecar(state, payload.status);
            }
            EventEnvelope::AuditAppended(payload) => {
                self.append_audit(payload.entry);
            }
            EventEnvelope::ChatDelta(payload) => {
                check_mode(tag, turn.mode, payload.mode)?;
                check_conversation(tag, turn, payload.conversation_id.as_deref())?;
                if turn.final_received {
                    return Err(ProtocolError::FragmentAfterFinal);
                }
                let message = &mut state.messages[turn.assistant_index];
                message.text.push_str(&payload.text);
                let outgoing = ChatTextPayload {
                    message_id: Some(message.id.clone()),
                    conversation_id: turn.conversation_id.clone(),
                    ..payload
                };
                if state.phase == TurnPhase::Dispatched {
                    state.phase = TurnPhase::Streaming;
                }
                self.publish(SessionUpdate::Event(EventEnvelope::ChatDelta(outgoing)));
            }
            EventEnvelope::ChatFinal(payload) => {
                check_mode(tag, turn.mode, payload.mode)?;
                check_conversation(tag, turn, payload.conversation_id.as_deref())?;
                if turn.final_received {
                    return Err(ProtocolError::FragmentAfterFinal);
                }
                let message = &mut state.messages[turn.assistant_index];
                if !payload.text.is_empty() {
                    let remainder = payload
                        .text
                        .strip_prefix(message.text.as_str())
                        .ok_or(ProtocolError::FinalTextDiverged)?;
                    message.text.push_str(remainder);
                }
                turn.final_received = true;
                let outgoing = ChatTextPayload {
                    mode: payload.mode,
                    text: message.text.clone(),
                    conversation_id: turn.conversation_id.clone(),
                    message_id: Some(message.id.clone()),
                };
                if state.phase == TurnPhase::Dispatched {
                    state.phase = TurnPhase::Streaming;
                }
                self.publish(SessionUpdate::Event(EventEnvelope::ChatFinal(outgoing)));
            }
            EventEnvelope::RunCard(payload) => {
                check_mode(tag, turn.mode, payload.mode)?;
                let run_id = payload.run.run_id.clone();
                let change = state.run_cards.announce(payload.run)?;
                if change == CardChange::Created {
                    turn.run_ids.push(run_id.clone());
                }
                if let Some(card) = state.run_cards.get(&run_id).cloned() {
                    tracing::debug!(session_id = %self.id, run_id = %run_id, status = %card.status, "run card announced");
                    let conversation_id = turn.conversation_id.clone();
                    self.publish_card(turn.mode, conversation_id, card);
                }
            }
            EventEnvelope::PermissionRequested(payload) => {
                let prompt = payload.prompt;
                if !prompt.tool.risk.requires_approval() {
                    return Err(ProtocolError::SafeToolPrompt {
                        tool: prompt.tool.name,
                    });
                }
                if prompt.source != turn.mode.prompt_source() {
                    return Err(ProtocolError::PromptSourceMismatch {
                        source_name: prompt.source.as_str().to_string(),
                        mode: turn.mode.to_string(),
                    });
                }
                let waiter = state.broker.request(prompt);
                state.phase = TurnPhase::AwaitingApproval;
                self.move_turn_cards(
                    state,
                    |status| status == RunCardStatus::Running,
                    RunCardStatus::PendingApproval,
                );
                return Ok(Step::Suspend(waiter));
            }
        }
        Ok(Step::Continue)
    }

    /// Applies a resolved decision: audit first, then the run card transition it explains.
    fn settle_decision(
        &self,
        state: &mut SessionState,
        prompt: PermissionPrompt,
        resolution: Resolution,
    ) {
        let Some(turn) = state.turn.as_ref() else {
            return;
        };
        let mode = turn.mode;
        turn.link.forward_reply(
            &turn.key,
            &PermissionReply {
                request_id: resolution.request_id.clone(),
                decision: resolution.decision,
            },
        );
        self.audit_decision(mode, &prompt, &resolution);

        match resolution.decision {
            PermissionDecision::AllowOnce => {
                state.allowed_tools.insert(
                    prompt.tool.id.clone(),
                    AllowedTool {
                        name: prompt.tool.name.clone(),
                        agent: mode,
                        risk: prompt.tool.risk,
                        arguments: prompt.tool.arguments.clone(),
                    },
                );
                self.move_turn_cards(
                    state,
                    |status| status == RunCardStatus::PendingApproval,
                    RunCardStatus::Running,
                );
                state.phase = TurnPhase::Streaming;
            }
            PermissionDecision::Deny => {
                self.move_turn_cards(
                    state,
                    |status| !status.is_terminal(),
                    RunCardStatus::Cancelled,
                );
                let note = match resolution.reason {
                    ResolutionReason::Timeout => TIMED_OUT_NOTE,
                    _ => DENIED_NOTE,
                };
                self.append_assistant_text(state, note);
                self.finish_turn(state, TurnOutcome::Denied);
            }
        }
    }

    /// Rejects a protocol error, aborting the active turn if there is one.
    fn reject(&self, state: &mut SessionState, err: ProtocolError) {
        if state.turn.is_some() {
            self.fail_turn(state, err);
        } else {
            tracing::warn!(session_id = %self.id, error = %err, "rejected event");
            self.push_notice(state, Notice::from(&err));
        }
    }

    fn fail_turn(&self, state: &mut SessionState, err: ProtocolError) -> TurnOutcome {
        tracing::warn!(session_id = %self.id, error = %err, "protocol error aborted turn");
        self.push_notice(state, Notice::from(&err));
        self.release_prompt(state, ResolutionReason::Aborted);
        self.move_turn_cards(
            state,
            |status| !status.is_terminal(),
            RunCardStatus::Error,
        );
        self.append_assistant_text(state, ABORTED_NOTE);
        self.finish_turn(
            state,
            TurnOutcome::Failed {
                detail: err.to_string(),
            },
        )
    }

    /// Denies a pending prompt locally, keeping the audit trail and the sidecar informed.
    fn release_prompt(&self, state: &mut SessionState, reason: ResolutionReason) {
        let Some((prompt, resolution)) = state.broker.release(reason) else {
            return;
        };
        if let Some(turn) = state.turn.as_ref() {
            turn.link.forward_reply(
                &turn.key,
                &PermissionReply {
                    request_id: resolution.request_id.clone(),
                    decision: resolution.decision,
                },
            );
            self.audit_decision(turn.mode, &prompt, &resolution);
        }
    }

    fn finish_turn(&self, state: &mut SessionState, outcome: TurnOutcome) -> TurnOutcome {
        let Some(turn) = state.turn.take() else {
            return outcome;
        };
        state.phase = TurnPhase::Idle;
        let finished = TurnFinished {
            turn_id: turn.id,
            outcome: outcome.clone(),
        };
        state.last_outcome = Some(finished.clone());
        turn.link.close_turn(&turn.key);
        turn.done.send_replace(Some(outcome.clone()));
        self.publish(SessionUpdate::TurnFinished(finished));
        outcome
    }

    fn move_turn_cards(
        &self,
        state: &mut SessionState,
        from: impl Fn(RunCardStatus) -> bool,
        next: RunCardStatus,
    ) {
        let Some(turn) = state.turn.as_ref() else {
            return;
        };
        let changed = state.run_cards.transition_where(&turn.run_ids, from, next);
        for card in changed {
            tracing::debug!(session_id = %self.id, run_id = %card.run_id, status = %card.status, "run card moved");
            self.publish_card(turn.mode, turn.conversation_id.clone(), card);
        }
    }

    fn append_assistant_text(&self, state: &mut SessionState, note: &str) {
        let Some(turn) = state.turn.as_ref() else {
            return;
        };
        let message = &mut state.messages[turn.assistant_index];
        message.text.push_str(note);
        self.publish(SessionUpdate::Event(EventEnvelope::ChatDelta(
            ChatTextPayload {
                mode: turn.mode,
                text: note.to_string(),
                conversation_id: turn.conversation_id.clone(),
                message_id: Some(message.id.clone()),
            },
        )));
    }

    fn audit_decision(&self, mode: AgentMode, prompt: &PermissionPrompt, resolution: &Resolution) {
        let error = resolution.reason.audit_code().map(|code| {
            json!({
                "code": code,
                "message": format!("request {} resolved without a user decision", resolution.request_id),
            })
        });
        self.append_audit(AuditEntry {
            timestamp: now_timestamp(),
            tool_name: prompt.tool.name.clone(),
            agent: mode,
            risk: prompt.tool.risk,
            decision: resolution.decision.into(),
            parameters: Some(prompt.tool.arguments.clone()),
            result: None,
            error,
        });
    }

    fn append_audit(&self, entry: AuditEntry) {
        self.audit.append(entry.clone());
        self.publish(SessionUpdate::Event(EventEnvelope::audit_appended(entry)));
    }

    fn record_sidecar(&self, state: &mut SessionState, status: SidecarStatus) {
        if !status.healthy {
            tracing::warn!(
                session_id = %self.id,
                sidecar = status.name.as_str(),
                detail = status.detail.as_deref().unwrap_or(""),
                "sidecar unhealthy"
            );
        }
        self.health.record(status.clone());
        state.sidecars.insert(status.name, status.clone());
        self.publish(SessionUpdate::Event(EventEnvelope::sidecar_status(status)));
    }

    fn publish_card(&self, mode: AgentMode, conversation_id: Option<String>, run: RunCard) {
        self.publish(SessionUpdate::Event(EventEnvelope::RunCard(
            RunCardPayload {
                mode,
                run,
                conversation_id,
            },
        )));
    }

    fn push_notice(&self, state: &mut SessionState, notice: Notice) {
        let notice = notice.with_session(self.id.clone());
        if state.notices.len() >= MAX_NOTICES {
            state.notices.remove(0);
        }
        state.notices.push(notice.clone());
        self.publish(SessionUpdate::Notice(notice));
    }

    fn publish(&self, update: SessionUpdate) {
        // Nobody listening is fine; the snapshot still carries the state.
        let _ = self.updates.send(update);
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_current(state: &SessionState, turn_id: TurnId) -> bool {
    state.turn.as_ref().is_some_and(|turn| turn.id == turn_id)
}

fn check_mode(tag: &str, expected: AgentMode, actual: AgentMode) -> Result<(), ProtocolError> {
    if expected == actual {
        return Ok(());
    }
    Err(ProtocolError::ModeMismatch {
        tag: tag.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}

fn check_conversation(
    tag: &str,
    turn: &ActiveTurn,
    conversation_id: Option<&str>,
) -> Result<(), ProtocolError> {
    match (turn.conversation_id.as_deref(), conversation_id) {
        (Some(expected), Some(actual)) if expected != actual => {
            Err(ProtocolError::ConversationMismatch {
                tag: tag.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
        _ => Ok(()),
    }
}
