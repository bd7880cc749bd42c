//! Normalization of agent output streams.
//!
//! Both agent families emit JSON Lines, but with unrelated schemas. Known
//! shapes are modelled as tagged enums ([`ClaudeEvent`], [`CodexEvent`]);
//! tool-call detection walks the raw JSON graph so it keeps working when a
//! vendor nests tool payloads somewhere new.

use crate::outcome::{CommandTrace, EditOperation, EditTool, ResultMeta};
use serde::Deserialize;
use serde_json::{Map, Value};

const SHELL_TOOL_NAME: &str = "Bash";
const TOOL_USE_TYPE: &str = "tool_use";
const FILE_PATH_KEYS: &[&str] = &["file_path", "path"];
const FILE_PATH_MAX_DEPTH: usize = 4;

/// One parsed object per line that looks like a complete JSON object; other lines are dropped.
pub fn parse_json_lines(output: &str) -> Vec<Value> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeEvent {
    Assistant { message: ClaudeMessage },
    User {},
    System {},
    Result {},
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeMessage {
    #[serde(default)]
    pub content: Vec<ClaudeContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeContentBlock {
    Text {
        #[serde(default)]
        text: Option<String>,
    },
    ToolUse {},
    ToolResult {},
    Thinking {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {},
    #[serde(rename = "turn.started")]
    TurnStarted {},
    #[serde(rename = "turn.completed")]
    TurnCompleted {},
    #[serde(rename = "turn.failed")]
    TurnFailed {},
    #[serde(rename = "item.started")]
    ItemStarted {},
    #[serde(rename = "item.updated")]
    ItemUpdated {},
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "error")]
    Error {},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexItem {
    AgentMessage {
        #[serde(default)]
        text: Option<String>,
    },
    CommandExecution {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        exit_code: Option<i64>,
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// A raw event classified into one of the two known protocols, if it matches either.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Claude(ClaudeEvent),
    Codex(CodexEvent),
    Unrecognized,
}

impl AgentEvent {
    pub fn classify(event: &Value) -> Self {
        if let Ok(codex) = CodexEvent::deserialize(event) {
            return Self::Codex(codex);
        }
        if let Ok(claude) = ClaudeEvent::deserialize(event) {
            return Self::Claude(claude);
        }
        Self::Unrecognized
    }
}

fn push_command(traces: &mut Vec<CommandTrace>, command: &str, failed: bool, event_index: usize) {
    let command = command.trim();
    if command.is_empty() {
        return;
    }
    let entry = CommandTrace {
        command: command.to_string(),
        failed,
        event_index,
    };
    if traces.last() == Some(&entry) {
        return;
    }
    traces.push(entry);
}

fn push_edit(operations: &mut Vec<EditOperation>, entry: EditOperation) {
    if operations.last() == Some(&entry) {
        return;
    }
    operations.push(entry);
}

fn str_field<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// Any finite, non-negative number, rounded to the nearest whole unit.
fn count_field(record: &Map<String, Value>, key: &str) -> Option<u64> {
    record
        .get(key)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.round() as u64)
}

fn bool_field(record: &Map<String, Value>, key: &str) -> Option<bool> {
    record.get(key).and_then(Value::as_bool)
}

/// An `error` field counts when it holds anything truthy.
fn error_value_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}

fn names_tool(record: &Map<String, Value>, tool: &str) -> bool {
    let name = str_field(record, "name");
    name == Some(tool)
        || str_field(record, "tool_name") == Some(tool)
        || (str_field(record, "type") == Some(TOOL_USE_TYPE) && name == Some(tool))
}

fn collect_shell_commands(
    value: &Value,
    traces: &mut Vec<CommandTrace>,
    event_index: usize,
    in_shell: bool,
    failed: bool,
) {
    let record = match value {
        Value::Array(items) => {
            for item in items {
                collect_shell_commands(item, traces, event_index, in_shell, failed);
            }
            return;
        }
        Value::Object(record) => record,
        _ => return,
    };

    let in_shell = in_shell || names_tool(record, SHELL_TOOL_NAME);
    let failed = failed
        || bool_field(record, "failed") == Some(true)
        || bool_field(record, "is_error") == Some(true)
        || bool_field(record, "success") == Some(false)
        || error_value_present(record.get("error"));

    if in_shell {
        if let Some(command) = str_field(record, "command") {
            push_command(traces, command, failed, event_index);
        }
    }

    for nested in record.values() {
        collect_shell_commands(nested, traces, event_index, in_shell, failed);
    }
}

fn collect_codex_command(event: &Value, traces: &mut Vec<CommandTrace>, event_index: usize) {
    let Ok(CodexEvent::ItemCompleted { item }) = CodexEvent::deserialize(event) else {
        return;
    };
    if let CodexItem::CommandExecution {
        command: Some(command),
        exit_code,
        status,
    } = item
    {
        let failed =
            exit_code.map(|code| code != 0).unwrap_or(false) || status.as_deref() == Some("failed");
        push_command(traces, &command, failed, event_index);
    }
}

/// Shell commands the agent ran, in emission order, with adjacent duplicates suppressed.
pub fn extract_command_trace(events: &[Value]) -> Vec<CommandTrace> {
    let mut traces = Vec::new();
    for (event_index, event) in events.iter().enumerate() {
        collect_shell_commands(event, &mut traces, event_index, false, false);
        collect_codex_command(event, &mut traces, event_index);
    }
    traces
}

fn first_string_by_keys(value: &Value, keys: &[&str], depth: usize) -> Option<String> {
    if depth > FILE_PATH_MAX_DEPTH {
        return None;
    }
    let record = value.as_object()?;
    for key in keys {
        if let Some(found) = str_field(record, key) {
            let found = found.trim();
            if !found.is_empty() {
                return Some(found.to_string());
            }
        }
    }
    record
        .values()
        .find_map(|nested| first_string_by_keys(nested, keys, depth + 1))
}

fn edit_tool_of(record: &Map<String, Value>) -> Option<EditTool> {
    str_field(record, "name")
        .and_then(EditTool::from_tool_name)
        .or_else(|| str_field(record, "tool_name").and_then(EditTool::from_tool_name))
}

fn collect_edit_operations(value: &Value, operations: &mut Vec<EditOperation>, event_index: usize) {
    let record = match value {
        Value::Array(items) => {
            for item in items {
                collect_edit_operations(item, operations, event_index);
            }
            return;
        }
        Value::Object(record) => record,
        _ => return,
    };

    if let Some(tool) = edit_tool_of(record) {
        push_edit(
            operations,
            EditOperation {
                tool,
                file_path: first_string_by_keys(value, FILE_PATH_KEYS, 0),
                event_index,
            },
        );
    }

    for nested in record.values() {
        collect_edit_operations(nested, operations, event_index);
    }
}

/// Edit/Write/MultiEdit tool invocations with the file each one targeted, when recoverable.
pub fn extract_edit_operations(events: &[Value]) -> Vec<EditOperation> {
    let mut operations = Vec::new();
    for (event_index, event) in events.iter().enumerate() {
        collect_edit_operations(event, &mut operations, event_index);
    }
    operations
}

fn text_from_content(content: &[ClaudeContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ClaudeContentBlock::Text { text } => text.as_deref(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn looks_like_result(record: &Map<String, Value>) -> bool {
    str_field(record, "type") == Some("result")
        || ["result", "subtype", "num_turns", "duration_ms"]
            .iter()
            .any(|key| record.contains_key(*key))
}

/// Terminal metadata, each field taken from the last event that set it.
pub fn extract_result_meta(events: &[Value]) -> ResultMeta {
    let mut meta = ResultMeta::default();
    let mut last_assistant_text = String::new();
    let mut turn_completions: u64 = 0;

    for event in events {
        let Some(record) = event.as_object() else {
            continue;
        };

        match AgentEvent::classify(event) {
            AgentEvent::Claude(ClaudeEvent::Assistant { message }) => {
                let text = text_from_content(&message.content);
                if !text.is_empty() {
                    last_assistant_text = text;
                }
            }
            AgentEvent::Codex(CodexEvent::ItemCompleted {
                item: CodexItem::AgentMessage { text: Some(text) },
            }) => {
                let text = text.trim();
                if !text.is_empty() {
                    last_assistant_text = text.to_string();
                }
            }
            AgentEvent::Codex(CodexEvent::TurnCompleted {}) => turn_completions += 1,
            AgentEvent::Claude(_) | AgentEvent::Codex(_) | AgentEvent::Unrecognized => {}
        }

        if !looks_like_result(record) {
            continue;
        }

        if let Some(text) = str_field(record, "result") {
            meta.text = text.to_string();
        }
        if let Some(subtype) = str_field(record, "subtype") {
            meta.subtype = Some(subtype.to_string());
        }
        if let Some(is_error) = bool_field(record, "is_error") {
            meta.is_error = is_error;
        }
        if let Some(error) = str_field(record, "error").filter(|e| !e.trim().is_empty()) {
            meta.error = Some(error.to_string());
        }
        if let Some(cost) = record.get("total_cost_usd").and_then(Value::as_f64) {
            meta.cost_usd = Some(cost);
        }
        if let Some(turns) = count_field(record, "num_turns") {
            meta.turns = Some(turns);
        }
        if let Some(duration) = count_field(record, "duration_ms") {
            meta.duration_ms = Some(duration);
        }
    }

    if meta.turns.is_none() && turn_completions > 0 {
        meta.turns = Some(turn_completions);
    }
    if meta.text.is_empty() && !last_assistant_text.is_empty() {
        meta.text = last_assistant_text;
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_json_lines_keeps_only_complete_objects() {
        let output = concat!(
            "starting agent...\n",
            "  {\"type\":\"system\",\"subtype\":\"init\"}  \r\n",
            "{\"broken\": \n",
            "[1,2,3]\n",
            "{not json}\n",
            "{\"type\":\"result\",\"result\":\"ok\"}\n",
        );
        let events = parse_json_lines(output);
        assert_eq!(
            events,
            vec![
                json!({"type":"system","subtype":"init"}),
                json!({"type":"result","result":"ok"}),
            ]
        );
        assert_eq!(parse_json_lines(output), events);
    }

    #[test]
    fn claude_tool_use_commands_are_traced() {
        let events = vec![
            json!({"type":"assistant","message":{"content":[
                {"type":"text","text":"checking"},
                {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"  but status  ","description":"status"}}
            ]}}),
            json!({"type":"assistant","message":{"content":[
                {"type":"tool_use","id":"t2","name":"Read","input":{"command":"not a shell"}}
            ]}}),
            json!({"type":"assistant","message":{"content":[
                {"type":"tool_use","id":"t3","name":"Bash","is_error":true,"input":{"command":"cargo test"}}
            ]}}),
        ];
        assert_eq!(
            extract_command_trace(&events),
            vec![
                CommandTrace { command: "but status".to_string(), failed: false, event_index: 0 },
                CommandTrace { command: "cargo test".to_string(), failed: true, event_index: 2 },
            ]
        );
    }

    #[test]
    fn tool_name_convention_and_error_values_mark_failure() {
        let events = vec![
            json!({"tool_name":"Bash","tool_input":{"command":"make"},"error":"exit 2"}),
            json!({"tool_name":"Bash","tool_input":{"command":"make"},"error":false,"success":true}),
            json!({"tool_name":"Bash","result":{"success":false,"command":"make check"}}),
        ];
        let trace = extract_command_trace(&events);
        assert_eq!(trace.len(), 3);
        assert!(trace[0].failed);
        assert!(!trace[1].failed);
        assert!(trace[2].failed);
        assert_eq!(trace[2].command, "make check");
    }

    #[test]
    fn codex_completed_command_item_is_traced() {
        let events = vec![
            json!({"type":"item.started","item":{"id":"i0","type":"command_execution","command":"ls -la","status":"in_progress"}}),
            json!({"type":"item.completed","item":{"id":"i0","type":"command_execution","command":"ls -la","exit_code":1,"status":"completed"}}),
            json!({"type":"item.completed","item":{"id":"i1","type":"command_execution","command":"pwd","exit_code":0,"status":"failed"}}),
            json!({"type":"item.completed","item":{"id":"i2","type":"command_execution","command":"true","exit_code":0,"status":"completed"}}),
        ];
        assert_eq!(
            extract_command_trace(&events),
            vec![
                CommandTrace { command: "ls -la".to_string(), failed: true, event_index: 1 },
                CommandTrace { command: "pwd".to_string(), failed: true, event_index: 2 },
                CommandTrace { command: "true".to_string(), failed: false, event_index: 3 },
            ]
        );
    }

    #[test]
    fn only_adjacent_duplicates_are_suppressed() {
        // Two identical commands inside one event collapse; repeats across events survive.
        let events = vec![
            json!({"name":"Bash","input":{"command":"git status"},"echo":{"command":"git status"}}),
            json!({"name":"Bash","input":{"command":"ls"}}),
            json!({"name":"Bash","input":{"command":"git status"}}),
        ];
        let trace = extract_command_trace(&events);
        let commands: Vec<_> = trace.iter().map(|t| (t.command.as_str(), t.event_index)).collect();
        assert_eq!(commands, vec![("git status", 0), ("ls", 1), ("git status", 2)]);
        assert!(trace.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn edit_operations_recover_file_paths() {
        let events = vec![
            json!({"type":"assistant","message":{"content":[
                {"type":"tool_use","name":"Edit","input":{"file_path":" src/lib.rs ","old_string":"a","new_string":"b"}},
                {"type":"tool_use","name":"Write","input":{"path":"README.md"}}
            ]}}),
            json!({"tool_name":"MultiEdit","tool_input":{"edits":[]}}),
            json!({"type":"tool_use","name":"Edit","input":{"a":{"b":{"c":{"d":{"file_path":"too/deep.rs"}}}}}}),
        ];
        assert_eq!(
            extract_edit_operations(&events),
            vec![
                EditOperation { tool: EditTool::Edit, file_path: Some("src/lib.rs".to_string()), event_index: 0 },
                EditOperation { tool: EditTool::Write, file_path: Some("README.md".to_string()), event_index: 0 },
                EditOperation { tool: EditTool::MultiEdit, file_path: None, event_index: 1 },
                EditOperation { tool: EditTool::Edit, file_path: None, event_index: 2 },
            ]
        );
    }

    #[test]
    fn result_event_after_details_sets_meta() {
        let events = vec![
            json!({"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}),
            json!({"type":"result","subtype":"success","is_error":false,"num_turns":3,"total_cost_usd":0.02,"duration_ms":1500,"result":"done"}),
        ];
        let meta = extract_result_meta(&events);
        assert_eq!(
            meta,
            ResultMeta {
                text: "done".to_string(),
                subtype: Some("success".to_string()),
                is_error: false,
                cost_usd: Some(0.02),
                turns: Some(3),
                duration_ms: Some(1500),
                error: None,
            }
        );
    }

    #[test]
    fn meta_fields_never_regress_to_null() {
        let events = vec![
            json!({"type":"system","subtype":"init","session_id":"s"}),
            json!({"type":"result","subtype":"error_max_turns","is_error":true,"num_turns":16,"total_cost_usd":0.5,"error":"max turns"}),
            json!({"type":"result","duration_ms":900,"error":"  "}),
        ];
        let meta = extract_result_meta(&events);
        assert_eq!(meta.subtype.as_deref(), Some("error_max_turns"));
        assert!(meta.is_error);
        assert_eq!(meta.turns, Some(16));
        assert_eq!(meta.cost_usd, Some(0.5));
        assert_eq!(meta.duration_ms, Some(900));
        assert_eq!(meta.error.as_deref(), Some("max turns"));
    }

    #[test]
    fn missing_result_falls_back_to_last_assistant_text() {
        let events = vec![
            json!({"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}),
            json!({"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}),
            json!({"type":"assistant","message":{"content":[{"type":"text","text":"second"},{"type":"text","text":"part"}]}}),
        ];
        let meta = extract_result_meta(&events);
        assert_eq!(meta.text, "second\npart");
        assert_eq!(meta.subtype, None);
        assert!(!meta.is_error);
    }

    #[test]
    fn text_block_without_text_keeps_its_siblings() {
        let events = vec![json!({"type":"assistant","message":{"content":[
            {"type":"text"},
            {"type":"text","text":"kept"}
        ]}})];
        let meta = extract_result_meta(&events);
        assert_eq!(meta.text, "kept");
    }

    #[test]
    fn float_encoded_turns_and_duration_are_kept() {
        let events = vec![
            json!({"type":"result","subtype":"success","num_turns":2.0,"duration_ms":1500.4}),
            json!({"type":"result","duration_ms":-5.0}),
        ];
        let meta = extract_result_meta(&events);
        assert_eq!(meta.turns, Some(2));
        assert_eq!(meta.duration_ms, Some(1500));
    }

    #[test]
    fn codex_stream_counts_turns_and_uses_agent_message() {
        let events = vec![
            json!({"type":"thread.started","thread_id":"th"}),
            json!({"type":"turn.started"}),
            json!({"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"  all set  "}}),
            json!({"type":"turn.completed","usage":{"input_tokens":10}}),
            json!({"type":"turn.started"}),
            json!({"type":"turn.completed","usage":{"input_tokens":12}}),
        ];
        let meta = extract_result_meta(&events);
        assert_eq!(meta.text, "all set");
        assert_eq!(meta.turns, Some(2));
    }

    #[test]
    fn classify_distinguishes_protocols() {
        assert!(matches!(
            AgentEvent::classify(&json!({"type":"turn.completed"})),
            AgentEvent::Codex(CodexEvent::TurnCompleted {})
        ));
        assert!(matches!(
            AgentEvent::classify(&json!({"type":"assistant","message":{"content":[]}})),
            AgentEvent::Claude(ClaudeEvent::Assistant { .. })
        ));
        assert!(matches!(
            AgentEvent::classify(&json!({"kind":"heartbeat"})),
            AgentEvent::Unrecognized
        ));
    }
}
