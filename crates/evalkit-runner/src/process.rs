use evalkit_core::truncate_detail;
use std::io::{self, Read};
use std::process::{Command, Output, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit == ProcessExit::Exited(0)
    }

    /// stdout followed by stderr, newline-separated when both are present.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub fn failure_detail(&self) -> String {
        let status = match self.exit {
            ProcessExit::Exited(code) => format!("exited with status {}", code),
            ProcessExit::Signaled => "terminated by signal".to_string(),
            ProcessExit::TimedOut => "timed out".to_string(),
        };
        let stderr = truncate_detail(&self.stderr);
        if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        }
    }
}

/// Extra time granted to drain the pipes after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<PipeReader> {
    pipe.map(|mut pipe| {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut out) = sink.lock() {
                            out.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });
        PipeReader { buf, done }
    })
}

/// Wait for EOF until `deadline`, then take whatever has been read so far.
fn drain_reader(reader: Option<PipeReader>, deadline: Instant) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let wait = deadline.saturating_duration_since(Instant::now());
    if reader.done.recv_timeout(wait).is_err() {
        warn!("output pipe still open past the deadline, keeping partial output");
    }
    let bytes = reader
        .buf
        .lock()
        .map(|out| out.clone())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child leads its own group, so this also reaches anything it spawned.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Run `cmd` to completion, forcibly killing it once `timeout` elapses.
/// Output is captured whatever the exit status. Anything the child left
/// running in its process group is killed once it exits, and output capture
/// never outlasts the timeout (plus a short drain grace after a kill).
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> io::Result<ProcessOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn()?;
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let exit = match child.wait_timeout(timeout)? {
        Some(status) => {
            // Background children would otherwise hold the pipes open.
            debug!(pid = child.id(), "child exited, reaping its process group");
            kill_process_group(child.id());
            match status.code() {
                Some(code) => ProcessExit::Exited(code),
                None => ProcessExit::Signaled,
            }
        }
        None => {
            warn!(
                pid = child.id(),
                timeout_ms = timeout.as_millis() as u64,
                "subprocess timed out, killing"
            );
            kill_process_group(child.id());
            let _ = child.kill();
            let _ = child.wait();
            ProcessExit::TimedOut
        }
    };

    let deadline = (started + timeout).max(Instant::now() + DRAIN_GRACE);
    Ok(ProcessOutput {
        exit,
        stdout: drain_reader(stdout_reader, deadline),
        stderr: drain_reader(stderr_reader, deadline),
    })
}

#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("failed to spawn: {0}")]
    Spawn(#[from] io::Error),
    #[error("{0}")]
    Exit(String),
}

/// Run to completion and require a zero exit; the error carries stderr (or stdout) as detail.
pub fn run_checked_command(mut cmd: Command) -> Result<Output, CommandFailure> {
    cmd.stdin(Stdio::null());
    let out = cmd.output()?;
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let status = out
        .status
        .code()
        .map(|c| format!("exited with status {}", c))
        .unwrap_or_else(|| "terminated by signal".to_string());
    let detail = if !stderr.is_empty() {
        format!("{}: {}", status, truncate_detail(&stderr))
    } else if !stdout.is_empty() {
        format!("{}: {}", status, truncate_detail(&stdout))
    } else {
        status
    };
    Err(CommandFailure::Exit(detail))
}
