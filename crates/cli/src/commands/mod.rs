//! CLI command implementations

pub mod config;
pub mod state;

pub use config::ConfigCommand;
pub use state::StateCommand;

use thiserror::Error;

/// Errors surfaced to the terminal
#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Processor(#[from] rowstream::ProcessorError),

    #[error(transparent)]
    State(#[from] rowstream::StateError),

    #[error("failed to render YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    InvalidInput(String),
}

pub type CliResult<T> = std::result::Result<T, CliError>;
