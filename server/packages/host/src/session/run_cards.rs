use jarvis_contracts::{ProtocolError, RunCard, RunCardStatus};

/// Where a card sits on running → pending_approval → running → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Running,
    AwaitingApproval,
    Resumed,
    Done,
}

impl Stage {
    fn from_status(status: RunCardStatus) -> Self {
        match status {
            RunCardStatus::Running => Self::Running,
            RunCardStatus::PendingApproval => Self::AwaitingApproval,
            RunCardStatus::Success | RunCardStatus::Error | RunCardStatus::Cancelled => Self::Done,
        }
    }

    fn advance(self, current: RunCardStatus, next: RunCardStatus) -> Option<Self> {
        if current == next {
            return Some(self);
        }
        match (self, next) {
            (Self::Done, _) => None,
            (_, status) if status.is_terminal() => Some(Self::Done),
            (Self::Running, RunCardStatus::PendingApproval) => Some(Self::AwaitingApproval),
            (Self::AwaitingApproval, RunCardStatus::Running) => Some(Self::Resumed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedCard {
    card: RunCard,
    stage: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardChange {
    Created,
    Updated,
}

/// Run cards of one session, in announcement order.
#[derive(Debug, Default)]
pub struct RunCardBoard {
    cards: Vec<TrackedCard>,
}

impl RunCardBoard {
    /// Applies a card announced by an agent. Moving a card backwards is a protocol error.
    pub fn announce(&mut self, card: RunCard) -> Result<CardChange, ProtocolError> {
        let Some(tracked) = self
            .cards
            .iter_mut()
            .find(|tracked| tracked.card.run_id == card.run_id)
        else {
            let stage = Stage::from_status(card.status);
            self.cards.push(TrackedCard { card, stage });
            return Ok(CardChange::Created);
        };

        let stage = tracked
            .stage
            .advance(tracked.card.status, card.status)
            .ok_or_else(|| ProtocolError::RunCardRegression {
                run_id: card.run_id.clone(),
                from: tracked.card.status.to_string(),
                to: card.status.to_string(),
            })?;
        tracked.stage = stage;
        tracked.card = card;
        Ok(CardChange::Updated)
    }

    /// Moves a card the orchestrator owns the transition for. Returns the updated card when the
    /// status actually changed; transitions the lifecycle does not allow are skipped.
    pub fn transition(&mut self, run_id: &str, next: RunCardStatus) -> Option<RunCard> {
        let tracked = self
            .cards
            .iter_mut()
            .find(|tracked| tracked.card.run_id == run_id)?;
        if tracked.card.status == next {
            return None;
        }
        let Some(stage) = tracked.stage.advance(tracked.card.status, next) else {
            tracing::debug!(
                run_id,
                from = %tracked.card.status,
                to = %next,
                "skipping run card transition"
            );
            return None;
        };
        tracked.stage = stage;
        tracked.card.status = next;
        Some(tracked.card.clone())
    }

    /// Applies `next` to every listed card currently in `from`.
    pub fn transition_where(
        &mut self,
        run_ids: &[String],
        from: impl Fn(RunCardStatus) -> bool,
        next: RunCardStatus,
    ) -> Vec<RunCard> {
        let mut changed = Vec::new();
        for run_id in run_ids {
            let eligible = self.get(run_id).is_some_and(|card| from(card.status));
            if !eligible {
                continue;
            }
            if let Some(card) = self.transition(run_id, next) {
                changed.push(card);
            }
        }
        changed
    }

    pub fn get(&self, run_id: &str) -> Option<&RunCard> {
        self.cards
            .iter()
            .find(|tracked| tracked.card.run_id == run_id)
            .map(|tracked| &tracked.card)
    }

    pub fn cards(&self) -> Vec<RunCard> {
        self.cards.iter().map(|tracked| tracked.card.clone()).collect()
    }
}
