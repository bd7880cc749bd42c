use crate::config::RunConfig;
use crate::error::AgentRunError;
use crate::events::parse_json_lines;
use crate::fixture::RunEnv;
use crate::process::{run_with_timeout, ProcessExit};
use evalkit_core::*;
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub fn build_policy_prompt() -> String {
    let agent_id_line =
        format!("Use --agent-id {EVAL_AGENT_ID} for but-engineering commands unless instructed otherwise.");
    [
        "This is an automated eval with behavioral checks.",
        "Execute the required shell commands from the task before finishing.",
        "You are in a multi-agent repository.",
        "Before editing files, coordinate using but-engineering commands.",
        "Before the first file edit, set plan + post a short start message + read channel at least once.",
        "When branch/stack dependencies appear, use `but` commands (status/branch/commit) rather than raw git.",
        "If commit/branch output indicates a dependency lock (for example locked to upstream commit), coordinate and align a stacked branch (`but branch new <child> -a <base>`).",
        "Do not stop after only reading files; perform the requested coordination actions.",
        "When prompted to run but-engineering check for a file, do it before editing that file.",
        agent_id_line.as_str(),
    ]
    .join("\n")
}

/// Environment for the wrapper script: the fixture env plus the runner contract variables.
pub fn agent_env(prompt: &str, config: &RunConfig, base: &RunEnv) -> RunEnv {
    let mut env = base.clone();
    let policy = config
        .policy_prompt
        .clone()
        .unwrap_or_else(build_policy_prompt);
    let pairs = [
        (EVALKIT_ENV_AGENT, config.agent.as_str().to_string()),
        (EVALKIT_ENV_RUNNER_BIN, config.runner_bin.clone()),
        (EVALKIT_ENV_CLAUDE_BIN, config.claude_bin.clone()),
        (EVALKIT_ENV_CODEX_BIN, config.codex_bin.clone()),
        (EVALKIT_ENV_MODEL, config.model.clone()),
        (EVALKIT_ENV_AUTH_MODE, config.auth_mode.as_str().to_string()),
        (EVALKIT_ENV_PROMPT, prompt.to_string()),
        (EVALKIT_ENV_ALLOWED_TOOLS, config.allowed_tools.join(",")),
        (EVALKIT_ENV_PERMISSION_MODE, PERMISSION_MODE_BYPASS.to_string()),
        (EVALKIT_ENV_APPEND_SYSTEM_PROMPT, policy),
        (EVALKIT_ENV_MIN_RUNNER_VERSION, config.min_runner_version.clone()),
        (EVALKIT_ENV_MIN_CLAUDE_VERSION, config.min_claude_version.clone()),
        (EVALKIT_ENV_MIN_CODEX_VERSION, config.min_codex_version.clone()),
        (EVALKIT_ENV_MAX_TURNS, config.max_turns.to_string()),
        (EVALKIT_ENV_AGENT_ID, EVAL_AGENT_ID.to_string()),
    ];
    for (name, value) in pairs {
        env.insert(name.to_string(), value);
    }
    env
}

/// Result of the final agent attempt.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub raw_output: String,
    pub events: Vec<Value>,
    pub attempts: u32,
    pub error: Option<AgentRunError>,
}

/// Only structural failures are retried: a timeout, or a run that produced no signal at all.
pub fn should_retry(error: Option<&AgentRunError>, raw_output: &str, event_count: usize) -> bool {
    error.is_some_and(AgentRunError::is_timeout)
        || (event_count == 0 && raw_output.trim().is_empty())
}

fn retry_backoff_delay(backoff_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(backoff_ms.saturating_mul(u64::from(attempt)))
}

fn run_attempt(config: &RunConfig, fixture_dir: &Path, env: &RunEnv) -> (String, Option<AgentRunError>) {
    let agent = config.agent.label();
    let mut cmd = Command::new("bash");
    cmd.arg(&config.runner_script)
        .current_dir(fixture_dir)
        .env_clear()
        .envs(env);

    match run_with_timeout(cmd, Duration::from_millis(config.timeout_ms)) {
        Ok(output) => {
            let raw = output.combined();
            let error = if output.success() {
                None
            } else if output.exit == ProcessExit::TimedOut {
                Some(AgentRunError::Timeout {
                    agent,
                    timeout_ms: config.timeout_ms,
                })
            } else {
                Some(AgentRunError::Failed {
                    agent,
                    detail: output.failure_detail(),
                })
            };
            (raw, error)
        }
        Err(err) => (
            String::new(),
            Some(AgentRunError::Failed {
                agent,
                detail: format!("failed to spawn {}: {}", config.runner_script.display(), err),
            }),
        ),
    }
}

/// Drive the wrapper script inside the fixture, retrying per [`should_retry`].
/// Each attempt's output replaces the previous one.
pub fn run_agent(prompt: &str, config: &RunConfig, fixture_dir: &Path, env: &RunEnv) -> AgentRun {
    let env = agent_env(prompt, config, env);
    let max_attempts = config.max_attempts();
    let mut attempt = 1;
    loop {
        info!(
            agent = config.agent.as_str(),
            attempt,
            max_attempts,
            "starting agent run"
        );
        let (raw_output, error) = run_attempt(config, fixture_dir, &env);
        let events = parse_json_lines(&raw_output);
        info!(
            attempt,
            events = events.len(),
            failed = error.is_some(),
            "agent run finished"
        );

        if !should_retry(error.as_ref(), &raw_output, events.len()) || attempt >= max_attempts {
            return AgentRun {
                raw_output,
                events,
                attempts: attempt,
                error,
            };
        }

        let delay = retry_backoff_delay(config.retry_backoff_ms, attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            "agent produced no usable output, retrying"
        );
        thread::sleep(delay);
        attempt += 1;
    }
}
