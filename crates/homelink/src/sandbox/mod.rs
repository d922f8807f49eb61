//! Automation sandbox for user scripts.
//!
//! A script runs in its own process and only sees `listen`, `set`, a live
//! `services` array, `console` and timers. The host talks to it over
//! newline-delimited JSON on stdin/stdout and never waits for it.

mod launcher;
mod protocol;
mod runtime;

use std::path::Path;
use std::path::PathBuf;

pub use launcher::Launcher;
pub use launcher::ProcessGuard;
pub use launcher::ProcessLauncher;
pub use launcher::ScriptProcess;
pub use launcher::DEFAULT_COMMAND;
pub use protocol::HostMessage;
pub use protocol::LogLevel;
pub use protocol::ScriptMessage;
pub use runtime::Sandbox;
pub use runtime::SandboxHandle;
pub use runtime::SandboxOptions;
pub use runtime::SandboxState;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Automation command is empty")]
    EmptyCommand,

    #[error("Failed to read script {path}: {source}")]
    ReadScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare script: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode script: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Script process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Read a script's source from disk.
pub fn load_script(path: &Path) -> Result<String, SandboxError> {
    std::fs::read_to_string(path).map_err(|source| SandboxError::ReadScript {
        path: path.to_path_buf(),
        source,
    })
}
