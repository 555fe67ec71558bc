use std::io;

use thiserror::Error;

use crate::control::ControlState;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("failed to persist {what}: {reason}")]
    Persistence { what: &'static str, reason: String },
    #[error("cannot {command} while run is {from}")]
    InvalidTransition {
        command: &'static str,
        from: ControlState,
    },
    #[error("run stopped before the record finished")]
    Interrupted,
    #[error("checkpoint belongs to a different dataset")]
    DatasetMismatch,
    #[error("record resolution panicked: {0}")]
    Panicked(String),
}
