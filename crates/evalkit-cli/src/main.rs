use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use evalkit_runner::{
    extract_command_trace, extract_edit_operations, extract_result_meta, parse_json_lines,
    resolve_config, EnvSnapshot, EvalProvider, ProviderConfig, TaskContext,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "EVALKIT_LOG";

#[derive(Parser)]
#[command(name = "evalkit", version = "0.3.0", about = "Agent-run evaluation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AgentArg {
    #[value(name = "claude")]
    Claude,
    #[value(name = "codex")]
    Codex,
}

impl AgentArg {
    fn as_str(self) -> &'static str {
        match self {
            AgentArg::Claude => "claude",
            AgentArg::Codex => "codex",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task against a fresh fixture and print the outcome payload.
    Run {
        prompt: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        agent: Option<AgentArg>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        setup_commands: Option<String>,
        #[arg(long)]
        watch_files: Option<String>,
        #[arg(long)]
        task_prompt: Option<String>,
        #[arg(long)]
        keep_fixtures: bool,
        #[arg(long)]
        pretty: bool,
    },
    /// Re-extract traces and result metadata from a captured agent output file.
    Normalize {
        output_file: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
    /// Show the resolved run configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        agent: Option<AgentArg>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(()) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})), false);
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            prompt,
            config,
            agent,
            model,
            setup_commands,
            watch_files,
            task_prompt,
            keep_fixtures,
            pretty,
        } => {
            let mut explicit = load_provider_config(config.as_deref())?;
            overlay_flags(&mut explicit, agent, model, keep_fixtures);
            let provider = EvalProvider::new(&explicit, EnvSnapshot::from_process());
            let context = TaskContext {
                prompt: task_prompt,
                setup_commands,
                watch_files: watch_files.map(Value::String),
            };
            let outcome = provider.execute(&prompt, &context);
            emit_json(&serde_json::to_value(&outcome)?, pretty);
        }
        Commands::Normalize {
            output_file,
            pretty,
        } => {
            let raw = fs::read_to_string(&output_file)
                .with_context(|| format!("reading {}", output_file.display()))?;
            emit_json(&normalize_payload(&raw)?, pretty);
        }
        Commands::Config {
            config,
            agent,
            model,
            json,
        } => {
            let mut explicit = load_provider_config(config.as_deref())?;
            overlay_flags(&mut explicit, agent, model, false);
            let resolved = resolve_config(&explicit, &EnvSnapshot::from_process());
            let value = serde_json::to_value(&resolved)?;
            if json {
                emit_json(&json!({ "ok": true, "command": "config", "config": value }), false);
            } else {
                print_config(&value);
            }
        }
    }
    Ok(())
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { .. } | Commands::Normalize { .. } => true,
        Commands::Config { json, .. } => *json,
    }
}

/// YAML (or JSON) provider config; a missing `--config` means an empty explicit layer.
fn load_provider_config(path: Option<&Path>) -> Result<ProviderConfig> {
    let Some(path) = path else {
        return Ok(ProviderConfig::default());
    };
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(ProviderConfig::default());
    }
    let parsed: ProviderConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    debug!(path = %path.display(), "loaded provider config");
    Ok(parsed)
}

fn overlay_flags(
    explicit: &mut ProviderConfig,
    agent: Option<AgentArg>,
    model: Option<String>,
    keep_fixtures: bool,
) {
    if let Some(agent) = agent {
        explicit.agent = Some(agent.as_str().to_string());
    }
    if model.is_some() {
        explicit.model = model;
    }
    if keep_fixtures {
        explicit.keep_fixtures = Some(true);
    }
}

fn normalize_payload(raw: &str) -> Result<Value> {
    let events = parse_json_lines(raw);
    let meta = extract_result_meta(&events);
    Ok(json!({
        "eventCount": events.len(),
        "commands": extract_command_trace(&events),
        "editOperations": extract_edit_operations(&events),
        "result": meta.text,
        "resultMeta": serde_json::to_value(&meta)?,
    }))
}

fn print_config(value: &Value) {
    let Some(fields) = value.as_object() else {
        println!("{}", value);
        return;
    };
    for (key, field) in fields {
        match field {
            Value::String(s) => println!("{}: {}", key, s),
            Value::Null => println!("{}: -", key),
            other => println!("{}: {}", key, other),
        }
    }
}

fn emit_json(value: &Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_overlay_config_file_values() {
        let mut explicit: ProviderConfig =
            serde_yaml::from_str("agent: claude\nmodel: from-file\nrunner_retries: 2\n")
                .expect("yaml");
        overlay_flags(&mut explicit, Some(AgentArg::Codex), None, true);
        assert_eq!(explicit.agent.as_deref(), Some("codex"));
        assert_eq!(explicit.model.as_deref(), Some("from-file"));
        assert_eq!(explicit.keep_fixtures, Some(true));
    }

    #[test]
    fn normalize_reports_counts_and_meta() {
        let raw = concat!(
            "booting\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"1\",\"type\":\"command_execution\",\"command\":\"ls -la\",\"exit_code\":1,\"status\":\"failed\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"2\",\"type\":\"agent_message\",\"text\":\"finished\"}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{}}\n",
        );
        let payload = normalize_payload(raw).expect("payload");
        assert_eq!(payload["eventCount"], 3);
        assert_eq!(
            payload["commands"],
            json!([{"command": "ls -la", "failed": true, "eventIndex": 0}])
        );
        assert_eq!(payload["result"], "finished");
        assert_eq!(payload["resultMeta"]["numTurns"], 1);
        assert_eq!(payload["resultMeta"]["isError"], false);
    }

    #[test]
    fn error_envelope_shape() {
        let value = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "command_failed");
        assert_eq!(value["error"]["message"], "boom");
    }
}
