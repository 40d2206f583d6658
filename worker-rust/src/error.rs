use gaia_ga_protocol::CommandKind;
use thiserror::Error;

use crate::worker::WorkerState;

/// Why a single command was not carried out. Never fatal to the worker.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command '{0}' will only be processed after prepare")]
    NotPrepared(CommandKind),

    #[error("engine already prepared")]
    AlreadyPrepared,

    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("command '{command}' is not valid while {state}")]
    InvalidState { command: CommandKind, state: WorkerState },

    #[error("engine failed during '{command}'")]
    Engine {
        command: CommandKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("handler for '{0}' panicked")]
    Panicked(CommandKind),
}

impl CommandError {
    pub fn engine(command: CommandKind, source: anyhow::Error) -> Self {
        Self::Engine { command, source: source.into() }
    }

    /// Rejections leave the worker untouched; anything else failed midway.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotPrepared(_)
                | Self::AlreadyPrepared
                | Self::AlreadyRunning
                | Self::InvalidState { .. }
        )
    }
}
