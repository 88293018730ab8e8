use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised by the credential lifecycle core.
///
/// Command handlers wrap these in `anyhow` with context; the renewal loop
/// inspects [`Error::is_transient`] to decide whether a retry is worthwhile.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no roles were returned by the identity provider")]
    NoRolesAvailable,

    #[error("malformed role ARN: {0}")]
    InvalidRoleArn(String),

    #[error("invalid role selection: {0}")]
    InvalidSelection(String),

    #[error("role '{0}' was not offered by the identity provider")]
    RoleNotFound(String),

    #[error("invalid factor '{0}' (expected auto, push, phone, sms, passcode or off)")]
    InvalidFactor(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unattended renewal requires interaction: {0}")]
    InteractionRequired(String),

    #[error("a renewal daemon is already running for profile '{profile}' (pid {pid})")]
    AlreadyRunning { profile: String, pid: u32 },

    #[error("could not confirm termination of renewal daemon (pid {pid}): {reason}")]
    DaemonUnreachable { pid: u32, reason: String },

    #[error("credential store {} is corrupt at line {line}: {reason}", path.display())]
    StoreCorrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Network and transport level failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
