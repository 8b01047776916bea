#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jarvis_contracts::{
    AgentMode, ChatRequest, EventEnvelope, PermissionPrompt, RunCardStatus,
};
use jarvis_host::agent_link::{AgentDirectory, ChannelLink, ScriptedLink, TurnFeed};
use jarvis_host::audit::AuditRecorder;
use jarvis_host::config::HostConfig;
use jarvis_host::scenarios::find_scenario;
use jarvis_host::session::{Session, SessionUpdate};
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> HostConfig {
    HostConfig::default().with_chunk_delay(Duration::ZERO)
}

pub fn scripted_session(scenario_id: &str, config: HostConfig) -> (Arc<Session>, Arc<ScriptedLink>) {
    let scenario = find_scenario(scenario_id).expect("scenario exists");
    let link = Arc::new(ScriptedLink::new(scenario, config.chunk_delay));
    let session = Session::new(
        "test",
        AgentDirectory::shared(link.clone()),
        Arc::new(AuditRecorder::new()),
        &config,
    );
    (session, link)
}

pub fn channel_session() -> (Arc<Session>, mpsc::UnboundedReceiver<TurnFeed>) {
    let (link, feeds) = ChannelLink::new();
    let session = Session::new(
        "test",
        AgentDirectory::shared(Arc::new(link)),
        Arc::new(AuditRecorder::new()),
        &test_config(),
    );
    (session, feeds)
}

pub fn request(mode: AgentMode, text: &str) -> ChatRequest {
    ChatRequest {
        mode,
        text: text.to_string(),
        repo_path: None,
        conversation_id: None,
    }
}

pub async fn next_feed(feeds: &mut mpsc::UnboundedReceiver<TurnFeed>) -> TurnFeed {
    tokio::time::timeout(WAIT, feeds.recv())
        .await
        .expect("turn opened in time")
        .expect("feed channel open")
}

pub async fn next_update(updates: &mut broadcast::Receiver<SessionUpdate>) -> SessionUpdate {
    tokio::time::timeout(WAIT, updates.recv())
        .await
        .expect("update in time")
        .expect("update channel open")
}

/// Collects updates until the next permission prompt, returning both.
pub async fn until_prompt(
    updates: &mut broadcast::Receiver<SessionUpdate>,
) -> (Vec<SessionUpdate>, PermissionPrompt) {
    let mut seen = Vec::new();
    loop {
        let update = next_update(updates).await;
        if let SessionUpdate::Event(EventEnvelope::PermissionRequested(payload)) = &update {
            let prompt = payload.prompt.clone();
            seen.push(update);
            return (seen, prompt);
        }
        seen.push(update);
    }
}

pub async fn until_finished(updates: &mut broadcast::Receiver<SessionUpdate>) -> Vec<SessionUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = next_update(updates).await;
        let finished = matches!(update, SessionUpdate::TurnFinished(_));
        seen.push(update);
        if finished {
            return seen;
        }
    }
}

/// Status sequence published for `run_id`, with refreshes collapsed.
pub fn card_statuses(updates: &[SessionUpdate], run_id: &str) -> Vec<RunCardStatus> {
    let mut statuses: Vec<RunCardStatus> = Vec::new();
    for update in updates {
        if let SessionUpdate::Event(EventEnvelope::RunCard(payload)) = update {
            if payload.run.run_id == run_id && statuses.last() != Some(&payload.run.status) {
                statuses.push(payload.run.status);
            }
        }
    }
    statuses
}

pub fn position(updates: &[SessionUpdate], predicate: impl Fn(&SessionUpdate) -> bool) -> usize {
    updates
        .iter()
        .position(predicate)
        .expect("update present")
}
