use jarvis_contracts::{AgentMode, RiskLevel, RunCardKind};
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize)]
pub struct DemoScenario {
    pub id: &'static str,
    pub title: &'static str,
    pub mode: AgentMode,
    pub input_placeholder: &'static str,
    pub assistant_text: &'static str,
    /// Chunk index after which the permission prompt is raised.
    pub permission_trigger_chunk: Option<usize>,
    pub tool: Option<ScenarioTool>,
    /// Safe tool reported straight to the audit log without a prompt.
    pub auto_tool: Option<ScenarioTool>,
    pub run_card: Option<ScenarioRunCard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioTool {
    pub name: &'static str,
    pub risk: RiskLevel,
    pub reason: &'static str,
    pub arguments: Value,
}

impl ScenarioTool {
    pub fn argument_map(&self) -> Map<String, Value> {
        self.arguments.as_object().cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRunCard {
    pub run_id: &'static str,
    pub kind: RunCardKind,
    pub title: &'static str,
    pub summary: &'static str,
}

pub fn demo_scenarios() -> Vec<DemoScenario> {
    vec![
        DemoScenario {
            id: "general-day-plan",
            title: "General: Daily planning",
            mode: AgentMode::General,
            input_placeholder: "Plan my day with two deep-work blocks",
            assistant_text: "Great. I will build a focused day plan. I want to open your calendar first to avoid overlap, then I will give a concise schedule with priorities and break windows.",
            permission_trigger_chunk: Some(9),
            tool: Some(ScenarioTool {
                name: "calendar.read",
                risk: RiskLevel::Risky,
                reason: "Read today's calendar to avoid overlapping blocks.",
                arguments: json!({ "range": "today" }),
            }),
            auto_tool: None,
            run_card: None,
        },
        DemoScenario {
            id: "general-brief",
            title: "General: Research brief",
            mode: AgentMode::General,
            input_placeholder: "Summarize this topic into five practical takeaways",
            assistant_text: "Understood. Here is a compact brief with five practical takeaways, one risk to watch, and one action you can do today to validate the approach.",
            permission_trigger_chunk: None,
            tool: None,
            auto_tool: Some(ScenarioTool {
                name: "notes.search",
                risk: RiskLevel::Safe,
                reason: "Look up saved notes on the topic.",
                arguments: json!({ "query": "practical takeaways" }),
            }),
            run_card: None,
        },
        DemoScenario {
            id: "code-fix-tests",
            title: "Code: Fix failing tests",
            mode: AgentMode::Code,
            input_placeholder: "Fix the failing tests and explain the patch",
            assistant_text: "I can handle this. I will run the test suite, isolate the failing case, apply a targeted patch, then report exactly what changed and why it resolves the failure.",
            permission_trigger_chunk: Some(8),
            tool: Some(ScenarioTool {
                name: "shell.exec",
                risk: RiskLevel::Risky,
                reason: "Run the project test suite.",
                arguments: json!({ "command": "pnpm test" }),
            }),
            auto_tool: None,
            run_card: Some(ScenarioRunCard {
                run_id: "run_fix_tests",
                kind: RunCardKind::Command,
                title: "Run tests",
                summary: "pnpm test",
            }),
        },
    ]
}

pub fn find_scenario(id: &str) -> Option<DemoScenario> {
    demo_scenarios()
        .into_iter()
        .find(|scenario| scenario.id == id)
}

/// Splits text into alternating word and whitespace chunks; concatenating them restores `text`.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_is_space = false;
    for ch in text.chars() {
        let is_space = ch.is_whitespace();
        if !current.is_empty() && is_space != current_is_space {
            chunks.push(std::mem::take(&mut current));
        }
        current_is_space = is_space;
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
