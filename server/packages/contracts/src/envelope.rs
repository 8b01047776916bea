use jarvis_error::ProtocolError;
use schemars::schema::RootSchema;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AgentMode, AuditEntry, PermissionPrompt, PermissionReply, RunCard, SidecarStatus};

const COMMAND_TAG: &str = "command";
const EVENT_TAG: &str = "event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum CommandEnvelope {
    SendChatMessage(ChatRequest),
    SwitchMode(SwitchModeArgs),
    ReplyPermission(PermissionReply),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatRequest {
    pub mode: AgentMode,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SwitchModeArgs {
    pub mode: AgentMode,
}

impl CommandEnvelope {
    pub const TAGS: &'static [&'static str] =
        &["send_chat_message", "switch_mode", "reply_permission"];

    pub fn tag(&self) -> &'static str {
        match self {
            Self::SendChatMessage(_) => "send_chat_message",
            Self::SwitchMode(_) => "switch_mode",
            Self::ReplyPermission(_) => "reply_permission",
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let tag = read_tag(&value, COMMAND_TAG, Self::TAGS)?;
        serde_json::from_value(value).map_err(|err| ProtocolError::invalid_payload(tag, err))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ProtocolError::invalid_payload(COMMAND_TAG, err))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", content = "payload")]
pub enum EventEnvelope {
    #[serde(rename = "sidecar.status")]
    SidecarStatus(SidecarStatusPayload),
    #[serde(rename = "chat.delta")]
    ChatDelta(ChatTextPayload),
    #[serde(rename = "chat.final")]
    ChatFinal(ChatTextPayload),
    #[serde(rename = "run.card")]
    RunCard(RunCardPayload),
    #[serde(rename = "permission.requested")]
    PermissionRequested(PermissionRequestedPayload),
    #[serde(rename = "audit.appended")]
    AuditAppended(AuditAppendedPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SidecarStatusPayload {
    pub status: SidecarStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatTextPayload {
    pub mode: AgentMode,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunCardPayload {
    pub mode: AgentMode,
    pub run: RunCard,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PermissionRequestedPayload {
    pub prompt: PermissionPrompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditAppendedPayload {
    pub entry: AuditEntry,
}

impl EventEnvelope {
    pub const TAGS: &'static [&'static str] = &[
        "sidecar.status",
        "chat.delta",
        "chat.final",
        "run.card",
        "permission.requested",
        "audit.appended",
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Self::SidecarStatus(_) => "sidecar.status",
            Self::ChatDelta(_) => "chat.delta",
            Self::ChatFinal(_) => "chat.final",
            Self::RunCard(_) => "run.card",
            Self::PermissionRequested(_) => "permission.requested",
            Self::AuditAppended(_) => "audit.appended",
        }
    }

    /// Events that only make sense inside the stream of the turn they belong to.
    pub fn is_turn_scoped(&self) -> bool {
        matches!(
            self,
            Self::ChatDelta(_) | Self::ChatFinal(_) | Self::RunCard(_) | Self::PermissionRequested(_)
        )
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let tag = read_tag(&value, EVENT_TAG, Self::TAGS)?;
        serde_json::from_value(value).map_err(|err| ProtocolError::invalid_payload(tag, err))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ProtocolError::invalid_payload(EVENT_TAG, err))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn chat_delta(mode: AgentMode, text: impl Into<String>) -> Self {
        Self::ChatDelta(ChatTextPayload {
            mode,
            text: text.into(),
            conversation_id: None,
            message_id: None,
        })
    }

    pub fn chat_final(mode: AgentMode, text: impl Into<String>) -> Self {
        Self::ChatFinal(ChatTextPayload {
            mode,
            text: text.into(),
            conversation_id: None,
            message_id: None,
        })
    }

    pub fn run_card(mode: AgentMode, run: RunCard) -> Self {
        Self::RunCard(RunCardPayload {
            mode,
            run,
            conversation_id: None,
        })
    }

    pub fn permission_requested(prompt: PermissionPrompt) -> Self {
        Self::PermissionRequested(PermissionRequestedPayload { prompt })
    }

    pub fn sidecar_status(status: SidecarStatus) -> Self {
        Self::SidecarStatus(SidecarStatusPayload { status })
    }

    pub fn audit_appended(entry: AuditEntry) -> Self {
        Self::AuditAppended(AuditAppendedPayload { entry })
    }
}

fn read_tag(
    value: &Value,
    field: &'static str,
    known: &[&'static str],
) -> Result<String, ProtocolError> {
    let tag = match value.get(field) {
        Some(Value::String(tag)) => tag.clone(),
        Some(other) => {
            return Err(ProtocolError::invalid_payload(
                field,
                format!("tag must be a string, got {other}"),
            ))
        }
        None => return Err(ProtocolError::MissingTag { field }),
    };
    if !known.contains(&tag.as_str()) {
        return Err(ProtocolError::UnknownTag { field, tag });
    }
    Ok(tag)
}

pub fn command_schema() -> RootSchema {
    schema_for!(CommandEnvelope)
}

pub fn event_schema() -> RootSchema {
    schema_for!(EventEnvelope)
}
