use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use super::SandboxError;

const PRELUDE: &str = include_str!("prelude.js");

/// Deno with no permissions and a capped V8 heap.
///
/// `{entry}` is replaced with the generated entry file, `{memory_mb}` with
/// the configured memory limit.
pub const DEFAULT_COMMAND: &[&str] = &[
    "deno",
    "run",
    "--quiet",
    "--no-prompt",
    "--v8-flags=--max-old-space-size={memory_mb}",
    "{entry}",
];

/// Variables kept when the environment is cleared.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "DENO_DIR"];

pub type ScriptStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type ScriptStdout = Box<dyn AsyncRead + Send + Unpin>;

/// A started script: its protocol pipes plus whatever keeps it alive.
pub struct ScriptProcess {
    pub stdin: ScriptStdin,
    pub stdout: ScriptStdout,
    pub guard: ProcessGuard,
}

impl ScriptProcess {
    /// Wrap in-memory pipes, mostly for tests.
    pub fn from_pipes(
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            guard: ProcessGuard::detached(),
        }
    }
}

/// Owns the child process and its scratch directory.
///
/// Dropping the guard kills the child and removes the directory.
#[derive(Debug)]
pub struct ProcessGuard {
    child: Option<Child>,
    _workdir: Option<TempDir>,
}

impl ProcessGuard {
    pub fn detached() -> Self {
        Self {
            child: None,
            _workdir: None,
        }
    }

    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("[automation] Failed to kill script process: {}", e);
            }
        }
    }
}

/// Starts script processes.
///
/// This trait allows the sandbox to be driven without a JavaScript runtime in
/// tests.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, source: &str) -> Result<ScriptProcess, SandboxError>;
}

/// Runs scripts in a separate OS process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: Vec<String>,
    memory_limit_mb: u64,
}

impl ProcessLauncher {
    pub fn new(command: Vec<String>, memory_limit_mb: u64) -> Self {
        Self {
            command,
            memory_limit_mb,
        }
    }

    fn argv(&self, entry: &Path) -> Vec<String> {
        let memory = self.memory_limit_mb.to_string();
        let entry = entry.display().to_string();
        self.command
            .iter()
            .map(|arg| arg.replace("{memory_mb}", &memory).replace("{entry}", &entry))
            .collect()
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(), 128)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, source: &str) -> Result<ScriptProcess, SandboxError> {
        let workdir = tempfile::Builder::new()
            .prefix("homelink-automation-")
            .tempdir()?;
        let entry = workdir.path().join("automation.js");
        let boot = format!(
            "{}\n__homelinkBoot({});\n",
            PRELUDE,
            serde_json::to_string(source)?
        );
        tokio::fs::write(&entry, boot).await?;

        let argv = self.argv(&entry);
        let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workdir.path())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(SandboxError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SandboxError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }
        debug!("[automation] Started {} (pid {:?})", program, child.id());

        Ok(ScriptProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            guard: ProcessGuard {
                child: Some(child),
                _workdir: Some(workdir),
            },
        })
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("[automation] stderr: {}", line);
    }
}
