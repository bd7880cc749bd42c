use evalkit_core::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
}

impl AgentKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Codex => "Codex",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Claude => DEFAULT_CLAUDE_MODEL,
            Self::Codex => DEFAULT_CODEX_MODEL,
        }
    }

    fn default_bin(self) -> &'static str {
        match self {
            Self::Claude => DEFAULT_CLAUDE_BIN,
            Self::Codex => DEFAULT_CODEX_BIN,
        }
    }

    fn default_runner(self) -> &'static str {
        match self {
            Self::Claude => DEFAULT_CLAUDE_RUNNER,
            Self::Codex => DEFAULT_CODEX_RUNNER,
        }
    }

    fn bin_env(self) -> &'static str {
        match self {
            Self::Claude => EVALKIT_ENV_CLAUDE_BIN,
            Self::Codex => EVALKIT_ENV_CODEX_BIN,
        }
    }

    fn min_version_env(self) -> &'static str {
        match self {
            Self::Claude => EVALKIT_ENV_MIN_CLAUDE_VERSION,
            Self::Codex => EVALKIT_ENV_MIN_CODEX_VERSION,
        }
    }

    fn default_min_version(self) -> &'static str {
        match self {
            Self::Claude => DEFAULT_MIN_CLAUDE_VERSION,
            Self::Codex => DEFAULT_MIN_CODEX_VERSION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Auto,
    Local,
    Api,
}

impl AuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "local" => Some(Self::Local),
            "api" => Some(Self::Api),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::Api => "api",
        }
    }
}

/// Numeric setting as written in a config file: either a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberSetting {
    Number(f64),
    Text(String),
}

impl NumberSetting {
    fn positive(&self) -> Option<u64> {
        match self {
            Self::Number(n) if n.is_finite() && *n >= 1.0 => Some(n.floor() as u64),
            Self::Number(_) => None,
            Self::Text(raw) => parse_positive_u64(raw),
        }
    }

    fn non_negative(&self) -> Option<u32> {
        match self {
            Self::Number(n) if n.is_finite() && *n >= 0.0 && *n <= u32::MAX as f64 => {
                Some(n.floor() as u32)
            }
            Self::Number(_) => None,
            Self::Text(raw) => parse_non_negative_u32(raw),
        }
    }
}

/// Explicit configuration layer, as supplied by the caller or a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub agent: Option<String>,
    pub model: Option<String>,
    pub repo_root: Option<PathBuf>,
    pub eval_dir: Option<PathBuf>,
    pub setup_script: Option<PathBuf>,
    pub coordination_bin: Option<PathBuf>,
    pub vcs_bin: Option<PathBuf>,
    pub runner: Option<String>,
    pub runner_bin: Option<String>,
    pub claude_runner: Option<String>,
    pub codex_runner: Option<String>,
    pub claude_bin: Option<String>,
    pub codex_bin: Option<String>,
    pub auth_mode: Option<String>,
    pub runner_timeout_ms: Option<NumberSetting>,
    pub claude_timeout_ms: Option<NumberSetting>,
    pub runner_max_turns: Option<NumberSetting>,
    pub runner_retries: Option<NumberSetting>,
    pub runner_retry_backoff_ms: Option<NumberSetting>,
    pub min_runner_version: Option<String>,
    pub min_claude_version: Option<String>,
    pub min_codex_version: Option<String>,
    pub keep_fixtures: Option<bool>,
    pub allowed_tools: Option<Vec<String>>,
    pub policy_prompt: Option<String>,
}

/// Process environment captured once per run, plus the directory it was captured in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
    cwd: PathBuf,
}

impl EnvSnapshot {
    pub fn new(vars: BTreeMap<String, String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            vars,
            cwd: cwd.into(),
        }
    }

    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { vars, cwd }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    /// Non-blank value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

/// Fully resolved, immutable settings for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub agent: AgentKind,
    pub model: String,
    pub repo_root: PathBuf,
    pub eval_dir: PathBuf,
    pub setup_script: PathBuf,
    pub runner_script: PathBuf,
    pub runner_bin: String,
    pub claude_bin: String,
    pub codex_bin: String,
    pub coordination_bin: PathBuf,
    pub vcs_bin: PathBuf,
    pub auth_mode: AuthMode,
    pub timeout_ms: u64,
    pub max_turns: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub allowed_tools: Vec<String>,
    pub min_runner_version: String,
    pub min_claude_version: String,
    pub min_codex_version: String,
    pub keep_fixtures: bool,
    pub policy_prompt: Option<String>,
}

impl RunConfig {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}

fn non_blank_path(value: Option<&PathBuf>) -> Option<PathBuf> {
    value.filter(|p| !p.as_os_str().is_empty()).cloned()
}

fn split_tool_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Nearest ancestor of `start` (within a few levels) that holds the fixture setup script.
pub fn discover_eval_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .take(EVAL_DIR_SEARCH_DEPTH)
        .find(|dir| dir.join(SETUP_FIXTURE_SCRIPT_NAME).is_file())
        .map(Path::to_path_buf)
}

fn resolve_in_dir(base: &Path, candidate: &str) -> PathBuf {
    let path = Path::new(candidate);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Layered resolution: environment, then explicit config, then built-in default.
/// Blank, unknown or malformed values fall through to the next layer.
pub fn resolve_config(explicit: &ProviderConfig, env: &EnvSnapshot) -> RunConfig {
    let agent = env
        .get(EVALKIT_ENV_AGENT)
        .and_then(AgentKind::parse)
        .or_else(|| non_blank(explicit.agent.as_ref()).and_then(AgentKind::parse))
        .unwrap_or(AgentKind::Claude);

    let eval_dir = env
        .get(EVALKIT_ENV_EVAL_DIR)
        .map(PathBuf::from)
        .or_else(|| non_blank_path(explicit.eval_dir.as_ref()))
        .or_else(|| discover_eval_dir(env.cwd()))
        .unwrap_or_else(|| env.cwd().to_path_buf());

    let repo_root = env
        .get(EVALKIT_ENV_REPO_ROOT)
        .map(PathBuf::from)
        .or_else(|| non_blank_path(explicit.repo_root.as_ref()))
        .or_else(|| eval_dir.ancestors().nth(3).map(Path::to_path_buf))
        .unwrap_or_else(|| eval_dir.clone());

    let setup_script = env
        .get(EVALKIT_ENV_SETUP_SCRIPT)
        .map(PathBuf::from)
        .or_else(|| non_blank_path(explicit.setup_script.as_ref()))
        .unwrap_or_else(|| eval_dir.join(SETUP_FIXTURE_SCRIPT_NAME));

    let agent_runner = match agent {
        AgentKind::Claude => explicit.claude_runner.as_ref(),
        AgentKind::Codex => explicit.codex_runner.as_ref(),
    };
    let runner = env
        .get(EVALKIT_ENV_RUNNER)
        .or_else(|| non_blank(explicit.runner.as_ref()))
        .or_else(|| non_blank(agent_runner))
        .unwrap_or(agent.default_runner());
    let runner_script = resolve_in_dir(&eval_dir, runner);

    let agent_bin = match agent {
        AgentKind::Claude => explicit.claude_bin.as_ref(),
        AgentKind::Codex => explicit.codex_bin.as_ref(),
    };
    let runner_bin = env
        .get(EVALKIT_ENV_RUNNER_BIN)
        .or_else(|| env.get(agent.bin_env()))
        .or_else(|| non_blank(explicit.runner_bin.as_ref()))
        .or_else(|| non_blank(agent_bin))
        .unwrap_or(agent.default_bin())
        .to_string();
    let claude_bin = match agent {
        AgentKind::Claude => runner_bin.clone(),
        AgentKind::Codex => env
            .get(EVALKIT_ENV_CLAUDE_BIN)
            .or_else(|| non_blank(explicit.claude_bin.as_ref()))
            .unwrap_or(DEFAULT_CLAUDE_BIN)
            .to_string(),
    };
    let codex_bin = match agent {
        AgentKind::Codex => runner_bin.clone(),
        AgentKind::Claude => env
            .get(EVALKIT_ENV_CODEX_BIN)
            .or_else(|| non_blank(explicit.codex_bin.as_ref()))
            .unwrap_or(DEFAULT_CODEX_BIN)
            .to_string(),
    };

    let coordination_bin = env
        .get(EVALKIT_ENV_COORDINATION_BIN)
        .map(PathBuf::from)
        .or_else(|| non_blank_path(explicit.coordination_bin.as_ref()))
        .unwrap_or_else(|| repo_root.join(DEFAULT_COORDINATION_BIN_REL));
    let vcs_bin = env
        .get(EVALKIT_ENV_VCS_BIN)
        .map(PathBuf::from)
        .or_else(|| non_blank_path(explicit.vcs_bin.as_ref()))
        .unwrap_or_else(|| repo_root.join(DEFAULT_VCS_BIN_REL));

    let auth_mode = env
        .get(EVALKIT_ENV_AUTH_MODE)
        .and_then(AuthMode::parse)
        .or_else(|| non_blank(explicit.auth_mode.as_ref()).and_then(AuthMode::parse))
        .unwrap_or(AuthMode::Auto);

    let model = env
        .get(EVALKIT_ENV_MODEL)
        .or_else(|| non_blank(explicit.model.as_ref()))
        .unwrap_or(agent.default_model())
        .to_string();

    let timeout_ms = env
        .get(EVALKIT_ENV_RUNNER_TIMEOUT_MS)
        .and_then(parse_positive_u64)
        .or_else(|| {
            env.get(EVALKIT_ENV_CLAUDE_TIMEOUT_MS)
                .and_then(parse_positive_u64)
        })
        .or_else(|| {
            explicit
                .runner_timeout_ms
                .as_ref()
                .and_then(NumberSetting::positive)
        })
        .or_else(|| {
            explicit
                .claude_timeout_ms
                .as_ref()
                .and_then(NumberSetting::positive)
        })
        .unwrap_or(DEFAULT_RUNNER_TIMEOUT_MS);

    let max_turns = env
        .get(EVALKIT_ENV_MAX_TURNS)
        .and_then(parse_positive_u64)
        .or_else(|| {
            explicit
                .runner_max_turns
                .as_ref()
                .and_then(NumberSetting::positive)
        })
        .unwrap_or(DEFAULT_RUNNER_MAX_TURNS);

    let retries = env
        .get(EVALKIT_ENV_RUNNER_RETRIES)
        .and_then(parse_non_negative_u32)
        .or_else(|| {
            explicit
                .runner_retries
                .as_ref()
                .and_then(NumberSetting::non_negative)
        })
        .unwrap_or(DEFAULT_RUNNER_RETRIES);

    let retry_backoff_ms = env
        .get(EVALKIT_ENV_RUNNER_RETRY_BACKOFF_MS)
        .and_then(parse_positive_u64)
        .or_else(|| {
            explicit
                .runner_retry_backoff_ms
                .as_ref()
                .and_then(NumberSetting::positive)
        })
        .unwrap_or(DEFAULT_RUNNER_RETRY_BACKOFF_MS);

    let allowed_tools = env
        .get(EVALKIT_ENV_ALLOWED_TOOLS)
        .map(split_tool_list)
        .filter(|tools| !tools.is_empty())
        .or_else(|| {
            explicit
                .allowed_tools
                .as_ref()
                .map(|tools| {
                    tools
                        .iter()
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|tools| !tools.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect());

    let agent_min_version = match agent {
        AgentKind::Claude => explicit.min_claude_version.as_ref(),
        AgentKind::Codex => explicit.min_codex_version.as_ref(),
    };
    let min_runner_version = env
        .get(EVALKIT_ENV_MIN_RUNNER_VERSION)
        .or_else(|| env.get(agent.min_version_env()))
        .or_else(|| non_blank(explicit.min_runner_version.as_ref()))
        .or_else(|| non_blank(agent_min_version))
        .unwrap_or(agent.default_min_version())
        .to_string();
    let min_claude_version = match agent {
        AgentKind::Claude => min_runner_version.clone(),
        AgentKind::Codex => env
            .get(EVALKIT_ENV_MIN_CLAUDE_VERSION)
            .or_else(|| non_blank(explicit.min_claude_version.as_ref()))
            .unwrap_or(DEFAULT_MIN_CLAUDE_VERSION)
            .to_string(),
    };
    let min_codex_version = match agent {
        AgentKind::Codex => min_runner_version.clone(),
        AgentKind::Claude => env
            .get(EVALKIT_ENV_MIN_CODEX_VERSION)
            .or_else(|| non_blank(explicit.min_codex_version.as_ref()))
            .unwrap_or(DEFAULT_MIN_CODEX_VERSION)
            .to_string(),
    };

    let keep_fixtures = env
        .get(EVALKIT_ENV_KEEP_FIXTURES)
        .and_then(parse_flag)
        .or(explicit.keep_fixtures)
        .unwrap_or(false);

    let policy_prompt = env
        .get(EVALKIT_ENV_POLICY_PROMPT)
        .or_else(|| non_blank(explicit.policy_prompt.as_ref()))
        .map(str::to_string);

    RunConfig {
        agent,
        model,
        repo_root,
        eval_dir,
        setup_script,
        runner_script,
        runner_bin,
        claude_bin,
        codex_bin,
        coordination_bin,
        vcs_bin,
        auth_mode,
        timeout_ms,
        max_turns,
        retries,
        retry_backoff_ms,
        allowed_tools,
        min_runner_version,
        min_claude_version,
        min_codex_version,
        keep_fixtures,
        policy_prompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_env() -> EnvSnapshot {
        EnvSnapshot::new(BTreeMap::new(), "/work/crates/tool/eval")
    }

    #[test]
    fn defaults_apply_when_no_layer_sets_a_value() {
        let cfg = resolve_config(&ProviderConfig::default(), &bare_env());
        assert_eq!(cfg.agent, AgentKind::Claude);
        assert_eq!(cfg.model, DEFAULT_CLAUDE_MODEL);
        assert_eq!(cfg.timeout_ms, DEFAULT_RUNNER_TIMEOUT_MS);
        assert_eq!(cfg.max_turns, DEFAULT_RUNNER_MAX_TURNS);
        assert_eq!(cfg.retries, DEFAULT_RUNNER_RETRIES);
        assert_eq!(cfg.retry_backoff_ms, DEFAULT_RUNNER_RETRY_BACKOFF_MS);
        assert_eq!(cfg.auth_mode, AuthMode::Auto);
        assert_eq!(cfg.allowed_tools.len(), DEFAULT_ALLOWED_TOOLS.len());
        assert_eq!(cfg.min_runner_version, DEFAULT_MIN_CLAUDE_VERSION);
        assert!(!cfg.keep_fixtures);
        assert_eq!(cfg.eval_dir, PathBuf::from("/work/crates/tool/eval"));
        assert_eq!(cfg.repo_root, PathBuf::from("/work"));
        assert_eq!(
            cfg.runner_script,
            PathBuf::from("/work/crates/tool/eval/providers/claude-local.sh")
        );
        assert_eq!(
            cfg.vcs_bin,
            PathBuf::from("/work/target/debug/but")
        );
    }

    #[test]
    fn environment_overrides_explicit_which_overrides_default() {
        let explicit = ProviderConfig {
            model: Some("explicit-model".to_string()),
            runner_max_turns: Some(NumberSetting::Number(7.0)),
            runner_timeout_ms: Some(NumberSetting::Text("9000".to_string())),
            ..ProviderConfig::default()
        };
        let env = bare_env().with(EVALKIT_ENV_MODEL, "env-model");
        let cfg = resolve_config(&explicit, &env);
        assert_eq!(cfg.model, "env-model");
        assert_eq!(cfg.max_turns, 7);
        assert_eq!(cfg.timeout_ms, 9000);
    }

    #[test]
    fn malformed_overrides_fall_through() {
        let explicit = ProviderConfig {
            runner_retry_backoff_ms: Some(NumberSetting::Number(250.0)),
            runner_timeout_ms: Some(NumberSetting::Number(-3.0)),
            agent: Some("gemini".to_string()),
            ..ProviderConfig::default()
        };
        let env = bare_env()
            .with(EVALKIT_ENV_RUNNER_RETRY_BACKOFF_MS, "soon")
            .with(EVALKIT_ENV_MAX_TURNS, "0")
            .with(EVALKIT_ENV_AUTH_MODE, "magic")
            .with(EVALKIT_ENV_MODEL, "   ");
        let cfg = resolve_config(&explicit, &env);
        assert_eq!(cfg.retry_backoff_ms, 250);
        assert_eq!(cfg.timeout_ms, DEFAULT_RUNNER_TIMEOUT_MS);
        assert_eq!(cfg.max_turns, DEFAULT_RUNNER_MAX_TURNS);
        assert_eq!(cfg.auth_mode, AuthMode::Auto);
        assert_eq!(cfg.agent, AgentKind::Claude);
        assert_eq!(cfg.model, DEFAULT_CLAUDE_MODEL);
    }

    #[test]
    fn legacy_timeout_env_is_consulted_after_primary() {
        let env = bare_env().with(EVALKIT_ENV_CLAUDE_TIMEOUT_MS, "4200");
        assert_eq!(
            resolve_config(&ProviderConfig::default(), &env).timeout_ms,
            4200
        );
        let env = env.with(EVALKIT_ENV_RUNNER_TIMEOUT_MS, "1000");
        assert_eq!(
            resolve_config(&ProviderConfig::default(), &env).timeout_ms,
            1000
        );
    }

    #[test]
    fn retries_accept_zero() {
        let env = bare_env().with(EVALKIT_ENV_RUNNER_RETRIES, "0");
        let cfg = resolve_config(&ProviderConfig::default(), &env);
        assert_eq!(cfg.retries, 0);
        assert_eq!(cfg.max_attempts(), 1);
    }

    #[test]
    fn codex_agent_switches_agent_specific_defaults() {
        let explicit = ProviderConfig {
            codex_bin: Some("/opt/codex".to_string()),
            claude_bin: Some("/opt/claude".to_string()),
            ..ProviderConfig::default()
        };
        let env = bare_env()
            .with(EVALKIT_ENV_AGENT, "codex")
            .with(EVALKIT_ENV_MIN_CLAUDE_VERSION, "2.0.0");
        let cfg = resolve_config(&explicit, &env);
        assert_eq!(cfg.agent, AgentKind::Codex);
        assert_eq!(cfg.model, DEFAULT_CODEX_MODEL);
        assert_eq!(cfg.runner_bin, "/opt/codex");
        assert_eq!(cfg.codex_bin, "/opt/codex");
        assert_eq!(cfg.claude_bin, "/opt/claude");
        assert_eq!(cfg.min_runner_version, DEFAULT_MIN_CODEX_VERSION);
        assert_eq!(cfg.min_codex_version, DEFAULT_MIN_CODEX_VERSION);
        assert_eq!(cfg.min_claude_version, "2.0.0");
        assert!(cfg.runner_script.ends_with("providers/codex-local.sh"));
    }

    #[test]
    fn allowed_tools_env_is_comma_split() {
        let env = bare_env().with(EVALKIT_ENV_ALLOWED_TOOLS, "Bash, Read,,Edit ");
        let cfg = resolve_config(&ProviderConfig::default(), &env);
        assert_eq!(cfg.allowed_tools, vec!["Bash", "Read", "Edit"]);
    }

    #[test]
    fn config_file_numbers_and_strings_both_deserialize() {
        let explicit: ProviderConfig = serde_json::from_str(
            r#"{"runner_retries": 3, "runner_timeout_ms": "5000", "keep_fixtures": true}"#,
        )
        .expect("config");
        let cfg = resolve_config(&explicit, &bare_env());
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.timeout_ms, 5000);
        assert!(cfg.keep_fixtures);
    }
}
