use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::Path;

pub const EVALKIT_ENV_AGENT: &str = "EVALKIT_AGENT";
pub const EVALKIT_ENV_MODEL: &str = "EVALKIT_MODEL";
pub const EVALKIT_ENV_REPO_ROOT: &str = "EVALKIT_REPO_ROOT";
pub const EVALKIT_ENV_EVAL_DIR: &str = "EVALKIT_EVAL_DIR";
pub const EVALKIT_ENV_SETUP_SCRIPT: &str = "EVALKIT_SETUP_SCRIPT";
pub const EVALKIT_ENV_RUNNER: &str = "EVALKIT_RUNNER";
pub const EVALKIT_ENV_RUNNER_BIN: &str = "EVALKIT_RUNNER_BIN";
pub const EVALKIT_ENV_CLAUDE_BIN: &str = "EVALKIT_CLAUDE_BIN";
pub const EVALKIT_ENV_CODEX_BIN: &str = "EVALKIT_CODEX_BIN";
pub const EVALKIT_ENV_COORDINATION_BIN: &str = "EVALKIT_COORDINATION_BIN";
pub const EVALKIT_ENV_VCS_BIN: &str = "EVALKIT_VCS_BIN";
pub const EVALKIT_ENV_AUTH_MODE: &str = "EVALKIT_AUTH_MODE";
pub const EVALKIT_ENV_RUNNER_TIMEOUT_MS: &str = "EVALKIT_RUNNER_TIMEOUT_MS";
pub const EVALKIT_ENV_CLAUDE_TIMEOUT_MS: &str = "EVALKIT_CLAUDE_TIMEOUT_MS";
pub const EVALKIT_ENV_MAX_TURNS: &str = "EVALKIT_MAX_TURNS";
pub const EVALKIT_ENV_RUNNER_RETRIES: &str = "EVALKIT_RUNNER_RETRIES";
pub const EVALKIT_ENV_RUNNER_RETRY_BACKOFF_MS: &str = "EVALKIT_RUNNER_RETRY_BACKOFF_MS";
pub const EVALKIT_ENV_ALLOWED_TOOLS: &str = "EVALKIT_ALLOWED_TOOLS";
pub const EVALKIT_ENV_MIN_RUNNER_VERSION: &str = "EVALKIT_MIN_RUNNER_VERSION";
pub const EVALKIT_ENV_MIN_CLAUDE_VERSION: &str = "EVALKIT_MIN_CLAUDE_VERSION";
pub const EVALKIT_ENV_MIN_CODEX_VERSION: &str = "EVALKIT_MIN_CODEX_VERSION";
pub const EVALKIT_ENV_KEEP_FIXTURES: &str = "EVALKIT_KEEP_FIXTURES";
pub const EVALKIT_ENV_POLICY_PROMPT: &str = "EVALKIT_POLICY_PROMPT";

// Exported to the runner wrapper script only.
pub const EVALKIT_ENV_PROMPT: &str = "EVALKIT_PROMPT";
pub const EVALKIT_ENV_PERMISSION_MODE: &str = "EVALKIT_PERMISSION_MODE";
pub const EVALKIT_ENV_APPEND_SYSTEM_PROMPT: &str = "EVALKIT_APPEND_SYSTEM_PROMPT";
pub const EVALKIT_ENV_AGENT_ID: &str = "EVALKIT_AGENT_ID";

/// App-data location read by the version-control tool.
pub const VCS_APP_DATA_DIR_ENV: &str = "E2E_TEST_APP_DATA_DIR";
pub const VCS_APP_DATA_DIR_NAME: &str = ".but-data";

pub const SETUP_FIXTURE_SCRIPT_NAME: &str = "setup-fixture.sh";
pub const EVAL_DIR_SEARCH_DEPTH: usize = 6;

pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_CODEX_MODEL: &str = "gpt-5-codex";
pub const DEFAULT_CLAUDE_BIN: &str = "claude";
pub const DEFAULT_CODEX_BIN: &str = "codex";
pub const DEFAULT_CLAUDE_RUNNER: &str = "providers/claude-local.sh";
pub const DEFAULT_CODEX_RUNNER: &str = "providers/codex-local.sh";
pub const DEFAULT_COORDINATION_BIN_REL: &str = "target/debug/but-engineering";
pub const DEFAULT_VCS_BIN_REL: &str = "target/debug/but";
pub const DEFAULT_RUNNER_TIMEOUT_MS: u64 = 180_000;
pub const DEFAULT_RUNNER_MAX_TURNS: u64 = 16;
pub const DEFAULT_RUNNER_RETRIES: u32 = 1;
pub const DEFAULT_RUNNER_RETRY_BACKOFF_MS: u64 = 1_500;
pub const DEFAULT_MIN_CLAUDE_VERSION: &str = "1.0.88";
pub const DEFAULT_MIN_CODEX_VERSION: &str = "0.99.0";
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Bash",
    "Read",
    "Edit",
    "Write",
    "Glob",
    "Grep",
    "LS",
    "MultiEdit",
    "TodoWrite",
];

pub const PERMISSION_MODE_BYPASS: &str = "bypassPermissions";
pub const EVAL_AGENT_ID: &str = "tier4-eval-agent";
pub const OBSERVER_AGENT_ID: &str = "tier4-observer";

/// Hash recorded for a watched path that does not exist.
pub const MISSING_FILE_SHA256: &str = "MISSING";

const MAX_DETAIL_CHARS: usize = 512;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex digest of the file, or [`MISSING_FILE_SHA256`] when nothing exists at `path`.
pub fn sha256_file_or_missing(path: &Path) -> std::io::Result<String> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(sha256_hex(&buf))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(MISSING_FILE_SHA256.to_string()),
        Err(err) => Err(err),
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Strictly positive decimal integer; anything else is `None`.
pub fn parse_positive_u64(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u64>().ok().filter(|v| *v > 0)
}

pub fn parse_non_negative_u32(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u32>().ok()
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Single-line excerpt of a diagnostic, bounded for embedding in error strings.
pub fn truncate_detail(raw: &str) -> String {
    let normalized = raw.trim().replace('\n', " ");
    if normalized.chars().count() <= MAX_DETAIL_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_DETAIL_CHARS).collect()
}
