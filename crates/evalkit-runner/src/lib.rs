//! Agent-run evaluation harness.
//!
//! [`EvalProvider::execute`] creates an isolated fixture repository, runs an
//! external coding agent inside it under a timeout/retry policy, normalizes the
//! agent's JSON Lines stream, and gathers side-effect telemetry into a single
//! [`RunOutcome`]. The fixture is removed afterwards unless retention was asked for.

pub mod agent;
pub mod collect;
pub mod config;
pub mod error;
pub mod events;
pub mod fixture;
pub mod outcome;
pub mod process;
pub mod watch;

pub use agent::{run_agent, AgentRun};
pub use config::{resolve_config, AgentKind, AuthMode, EnvSnapshot, ProviderConfig, RunConfig};
pub use error::{AgentRunError, CollectionError, HarnessError};
pub use events::{extract_command_trace, extract_edit_operations, extract_result_meta, parse_json_lines};
pub use outcome::{
    CommandTrace, CoordinationState, EditOperation, EditTool, ResultMeta, RunOutcome, WatchedFile,
};

use fixture::{FixtureGuard, RunEnv};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use watch::WatchSnapshot;

/// Per-task variables supplied alongside the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskContext {
    /// Replaces the call's prompt when non-blank.
    pub prompt: Option<String>,
    /// Shell snippet run inside the fixture before the agent starts.
    pub setup_commands: Option<String>,
    /// Paths to hash before and after the run: a JSON array or a comma/newline list.
    pub watch_files: Option<Value>,
}

impl TaskContext {
    fn task_prompt<'a>(&'a self, prompt: &'a str) -> &'a str {
        match self.prompt.as_deref() {
            Some(p) if !p.trim().is_empty() => p,
            _ => prompt,
        }
    }
}

/// Whatever a run has produced so far, kept so a failure can still report it.
#[derive(Default)]
struct RunProgress {
    fixture: Option<FixtureGuard>,
    run_env: RunEnv,
    watch_list: Vec<String>,
    before: Option<WatchSnapshot>,
    commands: Vec<CommandTrace>,
    edit_operations: Vec<EditOperation>,
    meta: ResultMeta,
    watched_files: Vec<WatchedFile>,
}

/// Folds a failed final agent attempt into the stream's own terminal metadata.
fn fold_runner_error(meta: &mut ResultMeta, runner_error: &AgentRunError) {
    meta.is_error = true;
    if meta.subtype.is_none() {
        meta.subtype = Some("error".to_string());
    }
    let runner_error = runner_error.to_string();
    meta.error = Some(match meta.error.take() {
        Some(existing) => format!("{}\n{}", existing, runner_error),
        None => runner_error,
    });
}

pub struct EvalProvider {
    config: RunConfig,
    env: EnvSnapshot,
}

impl EvalProvider {
    pub fn new(explicit: &ProviderConfig, env: EnvSnapshot) -> Self {
        let config = resolve_config(explicit, &env);
        debug!(?config, "resolved run config");
        Self { config, env }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run one task end to end. Never fails: fatal problems surface as `error` in the outcome.
    pub fn execute(&self, prompt: &str, context: &TaskContext) -> RunOutcome {
        let mut progress = RunProgress::default();
        let outcome = match self.run(prompt, context, &mut progress) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "run aborted");
                self.error_outcome(err, &mut progress)
            }
        };
        // Dropping the guard removes the fixture unless it is being kept.
        drop(progress);
        outcome
    }

    fn fixture_dir_field(&self, progress: &RunProgress) -> Option<String> {
        if !self.config.keep_fixtures {
            return None;
        }
        progress
            .fixture
            .as_ref()
            .map(|guard| guard.path().to_string_lossy().to_string())
    }

    fn run(
        &self,
        prompt: &str,
        context: &TaskContext,
        progress: &mut RunProgress,
    ) -> Result<RunOutcome, HarnessError> {
        let config = &self.config;
        progress.watch_list = watch::parse_watch_list(context.watch_files.as_ref());
        if !config.runner_script.is_file() {
            return Err(HarnessError::RunnerScriptMissing {
                agent: config.agent.label(),
                path: config.runner_script.clone(),
            });
        }

        let fixture_dir = fixture::create_fixture(config, &self.env)?;
        progress.fixture = Some(FixtureGuard::new(fixture_dir.clone(), config.keep_fixtures));
        progress.run_env = fixture::fixture_env(config, &self.env, &fixture_dir);

        fixture::preflight(&fixture_dir, &config.vcs_bin, &progress.run_env)?;
        fixture::run_setup_commands(
            context.setup_commands.as_deref(),
            &fixture_dir,
            &progress.run_env,
        )?;
        fixture::preflight(&fixture_dir, &config.vcs_bin, &progress.run_env)?;

        progress.before = Some(watch::snapshot(&fixture_dir, &progress.watch_list)?);

        let task_prompt = context.task_prompt(prompt).to_string();
        let run = run_agent(&task_prompt, config, &fixture_dir, &progress.run_env);
        info!(
            attempts = run.attempts,
            events = run.events.len(),
            "agent finished"
        );

        progress.commands = extract_command_trace(&run.events);
        progress.edit_operations = extract_edit_operations(&run.events);
        progress.meta = extract_result_meta(&run.events);
        if let Some(runner_error) = &run.error {
            fold_runner_error(&mut progress.meta, runner_error);
        }

        let before = progress.before.clone().unwrap_or_default();
        progress.watched_files = watch::diff(&fixture_dir, &progress.watch_list, &before)?;

        let coordination_state = collect::coordination_state_or_empty(
            &fixture_dir,
            &config.coordination_bin,
            &progress.run_env,
        );
        let repo = collect::collect_repo_state(&fixture_dir, &config.vcs_bin, &progress.run_env);

        Ok(RunOutcome {
            fixture_dir: self.fixture_dir_field(progress),
            task_prompt: Some(task_prompt),
            commands: std::mem::take(&mut progress.commands),
            edit_operations: std::mem::take(&mut progress.edit_operations),
            result: progress.meta.text.clone(),
            result_meta: progress.meta.clone(),
            coordination_state,
            repo_state: repo.repo_state,
            repo_state_error: repo.repo_state_error,
            watched_files: std::mem::take(&mut progress.watched_files),
            error: None,
        })
    }

    fn error_outcome(&self, err: HarnessError, progress: &mut RunProgress) -> RunOutcome {
        if progress.watched_files.is_empty() && !progress.watch_list.is_empty() {
            if let Some(guard) = &progress.fixture {
                let dir = guard.path();
                let before = match &progress.before {
                    Some(before) => Ok(before.clone()),
                    None => watch::snapshot(dir, &progress.watch_list),
                };
                match before.and_then(|before| watch::diff(dir, &progress.watch_list, &before)) {
                    Ok(files) => progress.watched_files = files,
                    Err(diff_err) => debug!(error = %diff_err, "watched-file diff skipped"),
                }
            }
        }

        RunOutcome {
            fixture_dir: self.fixture_dir_field(progress),
            task_prompt: None,
            commands: std::mem::take(&mut progress.commands),
            edit_operations: std::mem::take(&mut progress.edit_operations),
            result: progress.meta.text.clone(),
            result_meta: progress.meta.clone(),
            coordination_state: CoordinationState::default(),
            repo_state: None,
            repo_state_error: None,
            watched_files: std::mem::take(&mut progress.watched_files),
            error: Some(err.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use evalkit_core::ensure_dir;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    pub(crate) struct TempDirGuard {
        pub(crate) path: PathBuf,
    }

    impl TempDirGuard {
        pub(crate) fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    pub(crate) fn write_script(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            ensure_dir(parent).expect("script dir");
        }
        fs::write(path, body).expect("write script");
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
}
