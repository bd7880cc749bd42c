use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTrace {
    pub command: String,
    pub failed: bool,
    pub event_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditTool {
    Edit,
    Write,
    MultiEdit,
}

impl EditTool {
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "Edit" => Some(Self::Edit),
            "Write" => Some(Self::Write),
            "MultiEdit" => Some(Self::MultiEdit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    pub tool: EditTool,
    pub file_path: Option<String>,
    pub event_index: usize,
}

/// Terminal summary of a run. `text` is reported separately as the top-level `result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    #[serde(skip)]
    pub text: String,
    pub subtype: Option<String>,
    pub is_error: bool,
    #[serde(rename = "totalCostUsd")]
    pub cost_usd: Option<f64>,
    #[serde(rename = "numTurns")]
    pub turns: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedFile {
    pub path: String,
    pub before_sha256: String,
    pub after_sha256: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationState {
    pub agents: Vec<Value>,
    pub claims: Vec<Value>,
    pub messages: Vec<Value>,
    pub discoveries: Vec<Value>,
    pub blocks: Vec<Value>,
}

/// The single payload handed to the grader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub fixture_dir: Option<String>,
    pub task_prompt: Option<String>,
    pub commands: Vec<CommandTrace>,
    pub edit_operations: Vec<EditOperation>,
    pub result: String,
    pub result_meta: ResultMeta,
    pub coordination_state: CoordinationState,
    pub repo_state: Option<Value>,
    pub repo_state_error: Option<String>,
    pub watched_files: Vec<WatchedFile>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_serializes_to_grader_contract_keys() {
        let outcome = RunOutcome {
            fixture_dir: None,
            task_prompt: Some("do it".to_string()),
            commands: vec![CommandTrace {
                command: "ls".to_string(),
                failed: false,
                event_index: 2,
            }],
            edit_operations: vec![EditOperation {
                tool: EditTool::MultiEdit,
                file_path: Some("src/lib.rs".to_string()),
                event_index: 3,
            }],
            result: "done".to_string(),
            result_meta: ResultMeta {
                text: "done".to_string(),
                subtype: Some("success".to_string()),
                is_error: false,
                cost_usd: Some(0.02),
                turns: Some(3),
                duration_ms: Some(1500),
                error: None,
            },
            coordination_state: CoordinationState::default(),
            repo_state: None,
            repo_state_error: None,
            watched_files: Vec::new(),
            error: None,
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(
            value,
            json!({
                "fixtureDir": null,
                "taskPrompt": "do it",
                "commands": [{"command": "ls", "failed": false, "eventIndex": 2}],
                "editOperations": [{"tool": "MultiEdit", "filePath": "src/lib.rs", "eventIndex": 3}],
                "result": "done",
                "resultMeta": {
                    "subtype": "success",
                    "isError": false,
                    "totalCostUsd": 0.02,
                    "numTurns": 3,
                    "durationMs": 1500,
                    "error": null
                },
                "coordinationState": {
                    "agents": [], "claims": [], "messages": [], "discoveries": [], "blocks": []
                },
                "repoState": null,
                "repoStateError": null,
                "watchedFiles": [],
                "error": null
            })
        );
    }
}
