//! Error types for the agent.

use nethandoff_networking::NetworkError;
use thiserror::Error;

/// Errors from discovery, link configuration and the protocol services.
#[derive(Debug, Error)]
pub enum NetError {
    /// A link, address, route or neighbor entry does not exist.
    ///
    /// Callers may degrade instead of aborting on this one.
    #[error("not found: {0}")]
    NotFound(String),

    /// A link configuration step was rejected by the kernel.
    #[error("{op} failed: {detail}")]
    Link { op: String, detail: String },

    /// An external command could not be executed at all.
    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An external command produced output we could not understand.
    #[error("unexpected output from {command}: {detail}")]
    Parse { command: String, detail: String },

    /// Address or naming error.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),
}

impl NetError {
    pub fn link(op: impl Into<String>, detail: impl Into<String>) -> Self {
        NetError::Link {
            op: op.into(),
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NetError::NotFound(_))
    }

    /// Short machine-readable code, used as a structured log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            NetError::NotFound(_) => "not_found",
            NetError::Link { .. } => "link_config_failed",
            NetError::Command { .. } => "command_failed",
            NetError::Parse { .. } => "parse_failed",
            NetError::Network(_) => "invalid_address",
            NetError::Io(_) => "io_error",
            NetError::Syscall(_) => "syscall_error",
        }
    }
}

pub type Result<T, E = NetError> = std::result::Result<T, E>;
