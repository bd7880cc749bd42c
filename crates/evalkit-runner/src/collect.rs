use crate::error::CollectionError;
use crate::fixture::RunEnv;
use crate::outcome::CoordinationState;
use crate::process::{run_checked_command, CommandFailure};
use chrono::{DateTime, SecondsFormat, Utc};
use evalkit_core::OBSERVER_AGENT_ID;
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

fn run_tool(
    program: &Path,
    args: &[&str],
    fixture_dir: &Path,
    env: &RunEnv,
    step: &str,
) -> Result<String, CollectionError> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(fixture_dir).env_clear().envs(env);
    match run_checked_command(cmd) {
        Ok(out) => Ok(String::from_utf8_lossy(&out.stdout).to_string()),
        Err(CommandFailure::Spawn(source)) => Err(CollectionError::Spawn {
            step: step.to_string(),
            source,
        }),
        Err(CommandFailure::Exit(detail)) => Err(CollectionError::Command {
            step: step.to_string(),
            detail,
        }),
    }
}

fn json_list(output: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn messages_of_kind(messages: &[Value], kind: &str) -> Vec<Value> {
    messages
        .iter()
        .filter(|msg| msg.get("kind").and_then(Value::as_str) == Some(kind))
        .cloned()
        .collect()
}

/// Agents, claims and the full message log from the coordination CLI. Any failing
/// subcommand aborts the whole collection.
pub fn collect_coordination_state(
    fixture_dir: &Path,
    coordination_bin: &Path,
    env: &RunEnv,
) -> Result<CoordinationState, CollectionError> {
    let since = DateTime::<Utc>::UNIX_EPOCH.to_rfc3339_opts(SecondsFormat::Secs, true);
    let agents = run_tool(coordination_bin, &["agents"], fixture_dir, env, "agents")?;
    let claims = run_tool(coordination_bin, &["claims"], fixture_dir, env, "claims")?;
    let messages = run_tool(
        coordination_bin,
        &["read", "--agent-id", OBSERVER_AGENT_ID, "--since", &since],
        fixture_dir,
        env,
        "read",
    )?;

    let messages = json_list(&messages);
    let state = CoordinationState {
        agents: json_list(&agents),
        claims: json_list(&claims),
        discoveries: messages_of_kind(&messages, "discovery"),
        blocks: messages_of_kind(&messages, "block"),
        messages,
    };
    debug!(
        agents = state.agents.len(),
        claims = state.claims.len(),
        messages = state.messages.len(),
        "coordination state collected"
    );
    Ok(state)
}

/// Coordination state, or the empty state when the CLI is unavailable or failing.
pub fn coordination_state_or_empty(
    fixture_dir: &Path,
    coordination_bin: &Path,
    env: &RunEnv,
) -> CoordinationState {
    collect_coordination_state(fixture_dir, coordination_bin, env).unwrap_or_else(|err| {
        warn!(error = %err, "coordination state unavailable");
        CoordinationState::default()
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoStateCapture {
    pub repo_state: Option<Value>,
    pub repo_state_error: Option<String>,
}

/// Structured status of the fixture repository. Never fails: errors become a diagnostic.
pub fn collect_repo_state(fixture_dir: &Path, vcs_bin: &Path, env: &RunEnv) -> RepoStateCapture {
    let dir = fixture_dir.to_string_lossy();
    match run_tool(vcs_bin, &["-C", &dir, "status", "--json"], fixture_dir, env, "status") {
        Ok(output) => RepoStateCapture {
            repo_state: serde_json::from_str::<Value>(output.trim()).ok(),
            repo_state_error: None,
        },
        Err(err) => {
            warn!(error = %err, "repo state unavailable");
            RepoStateCapture {
                repo_state: None,
                repo_state_error: Some(err.to_string()),
            }
        }
    }
}
