use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;

use super::{Session, Step, TurnId, TurnOutcome};
use crate::agent_link::EventStream;

impl Session {
    /// Pulls the turn's events one at a time until the turn finishes.
    ///
    /// The stream is not polled while a permission prompt is pending, so nothing the agent
    /// produces after the prompt is applied before the decision.
    pub(super) async fn drive_turn(
        self: Arc<Self>,
        turn_id: TurnId,
        mut events: EventStream,
        mut done: watch::Receiver<Option<TurnOutcome>>,
    ) -> TurnOutcome {
        loop {
            if let Some(outcome) = done.borrow().clone() {
                return outcome;
            }

            let next = tokio::select! {
                biased;
                changed = done.changed() => {
                    if changed.is_err() {
                        return stale_outcome(turn_id);
                    }
                    continue;
                }
                next = events.next() => next,
            };

            let step = match next {
                Some(raw) => self.apply_turn_event(turn_id, raw),
                None => self.complete_turn(turn_id),
            };

            match step {
                Step::Continue => {}
                Step::Finished(outcome) => return outcome,
                Step::Stale => {
                    tracing::debug!(session_id = %self.id, turn_id, "turn superseded");
                    return done.borrow().clone().unwrap_or_else(|| stale_outcome(turn_id));
                }
                Step::Suspend(waiter) => {
                    let request_id = waiter.request_id().to_string();
                    match self.permission_timeout {
                        Some(limit) => {
                            if tokio::time::timeout(limit, waiter.wait()).await.is_err() {
                                self.expire_prompt(turn_id, &request_id);
                            }
                        }
                        None => {
                            waiter.wait().await;
                        }
                    }
                }
            }
        }
    }
}

fn stale_outcome(turn_id: TurnId) -> TurnOutcome {
    TurnOutcome::Failed {
        detail: format!("turn {turn_id} ended without an outcome"),
    }
}
