use jarvis_contracts::{EventEnvelope, PermissionDecision, PermissionPrompt, PermissionReply};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::session::SessionUpdate;

/// Why a pending permission request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    User,
    Timeout,
    Cancelled,
    Aborted,
}

impl ResolutionReason {
    /// Error code recorded in the audit entry for locally resolved requests.
    pub fn audit_code(self) -> Option<&'static str> {
        match self {
            Self::User => None,
            Self::Timeout => Some("permission_timeout"),
            Self::Cancelled => Some("turn_cancelled"),
            Self::Aborted => Some("turn_aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub request_id: String,
    pub decision: PermissionDecision,
    pub reason: ResolutionReason,
}

#[derive(Debug)]
struct PendingDecision {
    prompt: PermissionPrompt,
    sender: oneshot::Sender<Resolution>,
}

/// Single-slot wait cell correlating one permission prompt with its reply.
#[derive(Debug)]
pub struct PermissionBroker {
    pending: Option<PendingDecision>,
    updates: broadcast::Sender<SessionUpdate>,
}

/// Suspends a turn until the broker resolves its request.
#[derive(Debug)]
pub struct DecisionWaiter {
    request_id: String,
    receiver: oneshot::Receiver<Resolution>,
}

impl DecisionWaiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// A dropped broker slot counts as a local denial.
    pub async fn wait(self) -> Resolution {
        let request_id = self.request_id;
        self.receiver.await.unwrap_or(Resolution {
            request_id,
            decision: PermissionDecision::Deny,
            reason: ResolutionReason::Aborted,
        })
    }
}

impl PermissionBroker {
    pub fn new(updates: broadcast::Sender<SessionUpdate>) -> Self {
        Self {
            pending: None,
            updates,
        }
    }

    /// Parks `prompt` and publishes it to the UI.
    ///
    /// Panics if another request is still pending: prompts are single-flight per session and a
    /// second one means the agent side broke the contract.
    pub fn request(&mut self, prompt: PermissionPrompt) -> DecisionWaiter {
        if let Some(existing) = &self.pending {
            panic!(
                "permission request {} issued while {} is still pending",
                prompt.request_id, existing.prompt.request_id
            );
        }
        let (sender, receiver) = oneshot::channel();
        let request_id = prompt.request_id.clone();
        tracing::info!(
            request_id = %request_id,
            tool = %prompt.tool.name,
            "permission requested"
        );
        let _ = self.updates.send(SessionUpdate::Event(
            EventEnvelope::permission_requested(prompt.clone()),
        ));
        self.pending = Some(PendingDecision { prompt, sender });
        DecisionWaiter {
            request_id,
            receiver,
        }
    }

    /// Delivers a user decision. Replies for any id other than the pending one are ignored.
    pub fn resolve(&mut self, reply: &PermissionReply) -> Option<(PermissionPrompt, Resolution)> {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.prompt.request_id == reply.request_id);
        if !matches {
            tracing::debug!(request_id = %reply.request_id, "discarding stale permission reply");
            return None;
        }
        self.settle(reply.decision, ResolutionReason::User)
    }

    /// Resolves the pending request locally as a denial.
    pub fn release(&mut self, reason: ResolutionReason) -> Option<(PermissionPrompt, Resolution)> {
        self.settle(PermissionDecision::Deny, reason)
    }

    pub fn pending(&self) -> Option<&PermissionPrompt> {
        self.pending.as_ref().map(|pending| &pending.prompt)
    }

    pub fn pending_id(&self) -> Option<&str> {
        self.pending().map(|prompt| prompt.request_id.as_str())
    }

    fn settle(
        &mut self,
        decision: PermissionDecision,
        reason: ResolutionReason,
    ) -> Option<(PermissionPrompt, Resolution)> {
        let PendingDecision { prompt, sender } = self.pending.take()?;
        let resolution = Resolution {
            request_id: prompt.request_id.clone(),
            decision,
            reason,
        };
        tracing::info!(
            request_id = %resolution.request_id,
            decision = decision.as_str(),
            reason = ?reason,
            "permission resolved"
        );
        // The waiter may already be gone when its turn was torn down.
        let _ = sender.send(resolution.clone());
        Some((prompt, resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jarvis_contracts::{PromptSource, RiskLevel, ToolCall};
    use serde_json::Map;

    fn prompt(request_id: &str) -> PermissionPrompt {
        PermissionPrompt {
            request_id: request_id.to_string(),
            source: PromptSource::Opencode,
            tool: ToolCall {
                id: format!("tool-{request_id}"),
                name: "shell.exec".to_string(),
                arguments: Map::new(),
                risk: RiskLevel::Risky,
                reason: None,
            },
            ui: None,
        }
    }

    fn broker() -> (PermissionBroker, broadcast::Receiver<SessionUpdate>) {
        let (tx, rx) = broadcast::channel(16);
        (PermissionBroker::new(tx), rx)
    }

    #[tokio::test]
    async fn resolve_wakes_the_single_waiter() {
        let (mut broker, mut updates) = broker();
        let waiter = broker.request(prompt("perm-1"));
        assert!(matches!(
            updates.try_recv(),
            Ok(SessionUpdate::Event(EventEnvelope::PermissionRequested(_)))
        ));

        let settled = broker.resolve(&PermissionReply {
            request_id: "perm-1".to_string(),
            decision: PermissionDecision::AllowOnce,
        });
        assert!(settled.is_some());
        assert!(broker.pending().is_none());

        let resolution = waiter.wait().await;
        assert_eq!(resolution.decision, PermissionDecision::AllowOnce);
        assert_eq!(resolution.reason, ResolutionReason::User);
    }

    #[test]
    fn stale_and_duplicate_replies_are_noops() {
        let (mut broker, _updates) = broker();
        let stale = PermissionReply {
            request_id: "perm-0".to_string(),
            decision: PermissionDecision::Deny,
        };
        assert!(broker.resolve(&stale).is_none());

        let _waiter = broker.request(prompt("perm-1"));
        assert!(broker.resolve(&stale).is_none());
        assert_eq!(broker.pending_id(), Some("perm-1"));

        let reply = PermissionReply {
            request_id: "perm-1".to_string(),
            decision: PermissionDecision::Deny,
        };
        assert!(broker.resolve(&reply).is_some());
        assert!(broker.resolve(&reply).is_none());
    }

    #[tokio::test]
    async fn release_denies_locally() {
        let (mut broker, _updates) = broker();
        let waiter = broker.request(prompt("perm-1"));
        let (released, _) = broker
            .release(ResolutionReason::Timeout)
            .expect("pending prompt");
        assert_eq!(released.request_id, "perm-1");
        let resolution = waiter.wait().await;
        assert_eq!(resolution.decision, PermissionDecision::Deny);
        assert_eq!(resolution.reason.audit_code(), Some("permission_timeout"));
    }

    #[test]
    #[should_panic(expected = "still pending")]
    fn second_request_while_pending_panics() {
        let (mut broker, _updates) = broker();
        let _first = broker.request(prompt("perm-1"));
        let _second = broker.request(prompt("perm-2"));
    }
}
