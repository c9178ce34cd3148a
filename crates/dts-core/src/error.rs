use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DtsError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task already terminal: {0}")]
    TaskAlreadyTerminal(Uuid),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(Uuid),

    #[error("Incompatible destination endpoint: {0}")]
    IncompatibleDestination(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("User federation error: {0}")]
    Federation(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DtsError>;
