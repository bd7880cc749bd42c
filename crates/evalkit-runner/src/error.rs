use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a run before or around the agent invocation.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{agent} runner script not found: {}", path.display())]
    RunnerScriptMissing { agent: &'static str, path: PathBuf },

    #[error("{script} did not return a fixture path")]
    FixtureEmptyPath { script: String },

    #[error("fixture creation failed: {detail}")]
    FixtureCreation { detail: String },

    #[error("Failed setup_commands: {detail}")]
    SetupCommand { detail: String },

    #[error("fixture preflight failed (run 'but setup'): {detail}")]
    Preflight { detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Why the final agent attempt did not exit cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentRunError {
    #[error("{agent} runner timed out after {timeout_ms}ms.")]
    Timeout { agent: &'static str, timeout_ms: u64 },

    #[error("{agent} runner failed: {detail}")]
    Failed { agent: &'static str, detail: String },
}

impl AgentRunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Post-run telemetry that could not be gathered.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("{step}: {detail}")]
    Command { step: String, detail: String },

    #[error("{step}: {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },
}
