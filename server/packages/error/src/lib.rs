use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ProtocolError,
    TurnInProgress,
    NoActiveTurn,
    NotCancellable,
    SessionNotFound,
    InvalidConfig,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::ProtocolError => "urn:jarvis:error:protocol_error",
            Self::TurnInProgress => "urn:jarvis:error:turn_in_progress",
            Self::NoActiveTurn => "urn:jarvis:error:no_active_turn",
            Self::NotCancellable => "urn:jarvis:error:not_cancellable",
            Self::SessionNotFound => "urn:jarvis:error:session_not_found",
            Self::InvalidConfig => "urn:jarvis:error:invalid_config",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ProtocolError => "Protocol Error",
            Self::TurnInProgress => "Turn In Progress",
            Self::NoActiveTurn => "No Active Turn",
            Self::NotCancellable => "Not Cancellable",
            Self::SessionNotFound => "Session Not Found",
            Self::InvalidConfig => "Invalid Config",
        }
    }
}

/// An envelope or event that failed validation at the session boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("envelope is missing the `{field}` tag")]
    MissingTag { field: &'static str },
    #[error("unknown {field} `{tag}`")]
    UnknownTag { field: &'static str, tag: String },
    #[error("invalid payload for `{tag}`: {message}")]
    InvalidPayload { tag: String, message: String },
    #[error("`{tag}` targets mode {actual} but the turn runs in mode {expected}")]
    ModeMismatch {
        tag: String,
        expected: String,
        actual: String,
    },
    #[error("`{tag}` belongs to conversation {actual}, not {expected}")]
    ConversationMismatch {
        tag: String,
        expected: String,
        actual: String,
    },
    #[error("chat fragment arrived after the stream was finalized")]
    FragmentAfterFinal,
    #[error("final text diverges from the streamed fragments")]
    FinalTextDiverged,
    #[error("run card {run_id} cannot move from {from} to {to}")]
    RunCardRegression {
        run_id: String,
        from: String,
        to: String,
    },
    #[error("permission requested for safe tool `{tool}`")]
    SafeToolPrompt { tool: String },
    #[error("permission prompt from {source_name} does not match mode {mode}")]
    PromptSourceMismatch { source_name: String, mode: String },
    #[error("`{tag}` delivered outside the turn stream")]
    TurnEventOutOfBand { tag: String },
    #[error("`{tag}` arrived with no active turn")]
    NoActiveTurn { tag: String },
}

impl ProtocolError {
    pub fn invalid_payload(tag: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidPayload {
            tag: tag.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("turn in progress: {session_id}")]
    TurnInProgress { session_id: String },
    #[error("no active turn: {session_id}")]
    NoActiveTurn { session_id: String },
    #[error("turn cannot be cancelled while {phase}")]
    NotCancellable { session_id: String, phase: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl SessionError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Protocol(_) => ErrorType::ProtocolError,
            Self::TurnInProgress { .. } => ErrorType::TurnInProgress,
            Self::NoActiveTurn { .. } => ErrorType::NoActiveTurn,
            Self::NotCancellable { .. } => ErrorType::NotCancellable,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::InvalidConfig { .. } => ErrorType::InvalidConfig,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::TurnInProgress { session_id }
            | Self::NoActiveTurn { session_id }
            | Self::NotCancellable { session_id, .. }
            | Self::SessionNotFound { session_id } => Some(session_id),
            Self::Protocol(_) | Self::InvalidConfig { .. } => None,
        }
    }

    pub fn to_notice(&self) -> Notice {
        let mut notice = Notice::new(self.error_type(), Some(self.to_string()));
        notice.session_id = self.session_id().map(ToString::to_string);
        if let Self::NotCancellable { phase, .. } = self {
            notice
                .extensions
                .insert("phase".to_string(), Value::String(phase.clone()));
        }
        notice
    }
}

/// Non-fatal problem report surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Notice {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl Notice {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            detail,
            session_id: None,
            extensions: Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl From<SessionError> for Notice {
    fn from(value: SessionError) -> Self {
        value.to_notice()
    }
}

impl From<&SessionError> for Notice {
    fn from(value: &SessionError) -> Self {
        value.to_notice()
    }
}

impl From<&ProtocolError> for Notice {
    fn from(value: &ProtocolError) -> Self {
        Notice::new(
            ErrorType::ProtocolError,
            Some(format!("protocol error: {value}")),
        )
    }
}
