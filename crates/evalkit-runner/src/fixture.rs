use crate::config::{EnvSnapshot, RunConfig};
use crate::error::HarnessError;
use crate::process::{run_checked_command, CommandFailure};
use evalkit_core::{
    EVALKIT_ENV_AGENT_ID, EVALKIT_ENV_COORDINATION_BIN, EVALKIT_ENV_KEEP_FIXTURES,
    EVALKIT_ENV_REPO_ROOT, EVALKIT_ENV_VCS_BIN, EVAL_AGENT_ID, VCS_APP_DATA_DIR_ENV,
    VCS_APP_DATA_DIR_NAME,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub type RunEnv = BTreeMap<String, String>;

fn command_in(program: impl AsRef<std::ffi::OsStr>, cwd: &Path, env: &RunEnv) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(cwd).env_clear().envs(env);
    cmd
}

/// Invoke the setup script and return the fixture directory it printed.
pub fn create_fixture(config: &RunConfig, env: &EnvSnapshot) -> Result<PathBuf, HarnessError> {
    let mut script_env = env.vars().clone();
    script_env.insert(
        EVALKIT_ENV_REPO_ROOT.to_string(),
        config.repo_root.to_string_lossy().to_string(),
    );
    script_env.insert(
        EVALKIT_ENV_COORDINATION_BIN.to_string(),
        config.coordination_bin.to_string_lossy().to_string(),
    );
    script_env.insert(
        EVALKIT_ENV_VCS_BIN.to_string(),
        config.vcs_bin.to_string_lossy().to_string(),
    );
    script_env.insert(
        EVALKIT_ENV_KEEP_FIXTURES.to_string(),
        if config.keep_fixtures { "1" } else { "0" }.to_string(),
    );

    let mut cmd = command_in("bash", &config.eval_dir, &script_env);
    cmd.arg(&config.setup_script);
    let output = run_checked_command(cmd).map_err(|err| HarnessError::FixtureCreation {
        detail: err.to_string(),
    })?;

    // Scripts may log before the path; the path is the last non-blank line.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let fixture = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(PathBuf::from);
    match fixture {
        Some(path) => {
            info!(fixture = %path.display(), "fixture created");
            Ok(path)
        }
        None => Err(HarnessError::FixtureEmptyPath {
            script: config
                .setup_script
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| config.setup_script.to_string_lossy().to_string()),
        }),
    }
}

/// Environment shared by setup commands, the agent and the post-run collectors.
pub fn fixture_env(config: &RunConfig, env: &EnvSnapshot, fixture_dir: &Path) -> RunEnv {
    let mut run_env = env.vars().clone();
    run_env.insert(
        VCS_APP_DATA_DIR_ENV.to_string(),
        fixture_dir
            .join(VCS_APP_DATA_DIR_NAME)
            .to_string_lossy()
            .to_string(),
    );

    let mut path_dirs: Vec<PathBuf> = [&config.coordination_bin, &config.vcs_bin]
        .iter()
        .filter_map(|bin| bin.parent())
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
    if let Some(existing) = env.get("PATH") {
        path_dirs.extend(std::env::split_paths(existing));
    }
    if let Ok(joined) = std::env::join_paths(path_dirs) {
        run_env.insert("PATH".to_string(), joined.to_string_lossy().to_string());
    }

    run_env.insert(
        EVALKIT_ENV_COORDINATION_BIN.to_string(),
        config.coordination_bin.to_string_lossy().to_string(),
    );
    run_env.insert(
        EVALKIT_ENV_VCS_BIN.to_string(),
        config.vcs_bin.to_string_lossy().to_string(),
    );
    run_env.insert(EVALKIT_ENV_AGENT_ID.to_string(), EVAL_AGENT_ID.to_string());
    run_env
}

/// Run the optional pre-agent setup snippet inside the fixture.
pub fn run_setup_commands(
    script: Option<&str>,
    fixture_dir: &Path,
    env: &RunEnv,
) -> Result<(), HarnessError> {
    let script = match script {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(()),
    };
    let mut cmd = command_in("bash", fixture_dir, env);
    cmd.args(["-euo", "pipefail", "-c", script]);
    run_checked_command(cmd).map_err(|err| HarnessError::SetupCommand {
        detail: err.to_string(),
    })?;
    debug!("setup commands completed");
    Ok(())
}

/// `status --json` against the fixture; a failure means the agent would run on a broken repo.
pub fn preflight(fixture_dir: &Path, vcs_bin: &Path, env: &RunEnv) -> Result<(), HarnessError> {
    let mut cmd = command_in(vcs_bin, fixture_dir, env);
    cmd.arg("-C").arg(fixture_dir).args(["status", "--json"]);
    run_checked_command(cmd).map_err(|err| HarnessError::Preflight {
        detail: match err {
            CommandFailure::Spawn(e) => format!("{}: {}", vcs_bin.display(), e),
            CommandFailure::Exit(detail) => detail,
        },
    })?;
    Ok(())
}

pub fn destroy_fixture(fixture_dir: &Path) {
    match fs::remove_dir_all(fixture_dir) {
        Ok(()) => debug!(fixture = %fixture_dir.display(), "fixture removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(fixture = %fixture_dir.display(), error = %err, "fixture cleanup failed"),
    }
}

/// Removes the fixture when dropped unless retention was requested.
pub struct FixtureGuard {
    path: PathBuf,
    keep: bool,
}

impl FixtureGuard {
    pub fn new(path: PathBuf, keep: bool) -> Self {
        Self { path, keep }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FixtureGuard {
    fn drop(&mut self) {
        if self.keep {
            info!(fixture = %self.path.display(), "keeping fixture");
            return;
        }
        destroy_fixture(&self.path);
    }
}
