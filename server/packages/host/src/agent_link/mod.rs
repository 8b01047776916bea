//! Seams between a session and the sidecar that serves a turn.
//!
//! A link opens one lazy, finite event stream per turn. The session pulls events from it one at
//! a time, so a link never runs ahead of a pending permission prompt. Raw JSON values are handed
//! over untouched; validation happens in the session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::BoxStream;
use futures::StreamExt;
use jarvis_contracts::{AgentMode, ChatRequest, EventEnvelope, PermissionReply};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::session::TurnId;

mod scripted;

pub use self::scripted::ScriptedLink;

pub type EventStream = BoxStream<'static, Value>;

/// Identifies one turn of one session. Links shared between sessions route by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnKey {
    pub session_id: String,
    pub turn_id: TurnId,
}

pub trait AgentLink: Send + Sync + fmt::Debug {
    /// Opens the event stream for one turn. Called once per turn; every call starts over.
    fn open_turn(&self, turn: &TurnKey, request: &ChatRequest) -> EventStream;

    /// Forwards the decision for a prompt raised during `turn`.
    fn forward_reply(&self, _turn: &TurnKey, _reply: &PermissionReply) {}

    /// Called once the session finished `turn`.
    fn close_turn(&self, _turn: &TurnKey) {}
}

/// Link per agent mode.
#[derive(Debug, Clone)]
pub struct AgentDirectory {
    general: Arc<dyn AgentLink>,
    code: Arc<dyn AgentLink>,
}

impl AgentDirectory {
    pub fn new(general: Arc<dyn AgentLink>, code: Arc<dyn AgentLink>) -> Self {
        Self { general, code }
    }

    /// Routes both modes to the same link.
    pub fn shared(link: Arc<dyn AgentLink>) -> Self {
        Self {
            general: link.clone(),
            code: link,
        }
    }

    pub fn for_mode(&self, mode: AgentMode) -> Arc<dyn AgentLink> {
        match mode {
            AgentMode::General => self.general.clone(),
            AgentMode::Code => self.code.clone(),
        }
    }
}

/// Live side of a [`ChannelLink`] turn: whatever drives the real sidecar pushes events here.
#[derive(Debug)]
pub struct TurnFeed {
    pub turn: TurnKey,
    pub request: ChatRequest,
    events: mpsc::UnboundedSender<Value>,
    replies: mpsc::UnboundedReceiver<PermissionReply>,
}

impl TurnFeed {
    pub fn send(&self, event: EventEnvelope) -> bool {
        self.send_raw(event.to_value())
    }

    pub fn send_raw(&self, value: Value) -> bool {
        self.events.send(value).is_ok()
    }

    /// Waits for the next decision the session forwarded for this turn.
    pub async fn next_reply(&mut self) -> Option<PermissionReply> {
        self.replies.recv().await
    }

    /// Ends the turn's event stream.
    pub fn finish(self) {}
}

/// Link backed by channels, for hosts that bridge a real sidecar process.
#[derive(Debug)]
pub struct ChannelLink {
    feeds: mpsc::UnboundedSender<TurnFeed>,
    replies: Mutex<HashMap<TurnKey, mpsc::UnboundedSender<PermissionReply>>>,
}

impl ChannelLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TurnFeed>) {
        let (feeds, receiver) = mpsc::unbounded_channel();
        (
            Self {
                feeds,
                replies: Mutex::new(HashMap::new()),
            },
            receiver,
        )
    }

    fn reply_senders(
        &self,
    ) -> MutexGuard<'_, HashMap<TurnKey, mpsc::UnboundedSender<PermissionReply>>> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AgentLink for ChannelLink {
    fn open_turn(&self, turn: &TurnKey, request: &ChatRequest) -> EventStream {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::unbounded_channel();
        self.reply_senders().insert(turn.clone(), reply_tx);
        let feed = TurnFeed {
            turn: turn.clone(),
            request: request.clone(),
            events,
            replies,
        };
        if self.feeds.send(feed).is_err() {
            tracing::warn!(
                session_id = %turn.session_id,
                mode = %request.mode,
                "no sidecar bridge attached to channel link"
            );
        }
        UnboundedReceiverStream::new(event_rx).boxed()
    }

    fn forward_reply(&self, turn: &TurnKey, reply: &PermissionReply) {
        match self.reply_senders().get(turn) {
            Some(sender) => {
                let _ = sender.send(reply.clone());
            }
            None => tracing::debug!(
                session_id = %turn.session_id,
                turn_id = turn.turn_id,
                request_id = %reply.request_id,
                "no open turn for forwarded reply"
            ),
        }
    }

    fn close_turn(&self, turn: &TurnKey) {
        self.reply_senders().remove(turn);
    }
}
