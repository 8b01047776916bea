use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jarvis_contracts::{CommandEnvelope, SidecarStatus};
use jarvis_error::{Notice, SessionError};
use serde_json::Value;

use crate::agent_link::AgentDirectory;
use crate::audit::AuditRecorder;
use crate::config::HostConfig;
use crate::health::SidecarHealth;
use crate::session::{CommandOutcome, Session};

pub const DEFAULT_SESSION_ID: &str = "default";

/// Sessions keyed by conversation id, sharing one audit log.
#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    agents: AgentDirectory,
    audit: Arc<AuditRecorder>,
    health: Arc<SidecarHealth>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Host {
    pub fn new(agents: AgentDirectory, config: HostConfig) -> Self {
        Self {
            config,
            agents,
            audit: Arc::new(AuditRecorder::new()),
            health: Arc::new(SidecarHealth::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditRecorder> {
        &self.audit
    }

    /// Returns the session for `conversation_id`, creating it on first use.
    pub fn session(&self, conversation_id: Option<&str>) -> Arc<Session> {
        let id = conversation_id.unwrap_or(DEFAULT_SESSION_ID);
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id = id, "session created");
                Session::with_health(
                    id,
                    self.agents.clone(),
                    self.audit.clone(),
                    self.health.clone(),
                    &self.config,
                )
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Validates and routes a raw command. A rejected command is reported to the session its
    /// conversation id names, or the default session.
    pub fn dispatch_raw(&self, raw: Value) -> Result<CommandOutcome, SessionError> {
        let conversation_id = raw
            .pointer("/args/conversation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        match CommandEnvelope::from_value(raw) {
            Ok(command) => self.dispatch(command),
            Err(err) => {
                tracing::warn!(error = %err, "rejected command");
                self.session(conversation_id.as_deref())
                    .report(Notice::from(&err));
                Err(err.into())
            }
        }
    }

    /// Routes a command: chat by conversation id, replies to whichever session holds the
    /// request, mode switches to the default session.
    pub fn dispatch(&self, command: CommandEnvelope) -> Result<CommandOutcome, SessionError> {
        let session = match &command {
            CommandEnvelope::SendChatMessage(request) => {
                self.session(request.conversation_id.as_deref())
            }
            CommandEnvelope::SwitchMode(_) => self.session(None),
            CommandEnvelope::ReplyPermission(reply) => {
                let Some(session) = self.pending_owner(&reply.request_id) else {
                    tracing::debug!(request_id = %reply.request_id, "no session holds request");
                    return Ok(CommandOutcome::PermissionReplied { matched: false });
                };
                session
            }
        };
        session.handle_command(command)
    }

    pub fn health(&self) -> &Arc<SidecarHealth> {
        &self.health
    }

    /// Latest health report per sidecar, whichever session received it.
    pub fn sidecars(&self) -> Vec<SidecarStatus> {
        self.health.statuses()
    }

    fn pending_owner(&self, request_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|session| {
                session
                    .pending_prompt()
                    .is_some_and(|prompt| prompt.request_id == request_id)
            })
            .cloned()
    }
}
