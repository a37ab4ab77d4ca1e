use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Inbound payload could not be decoded into a telemetry message.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("device '{0}' not found")]
    NotFound(String),

    /// Malformed control intent or request body.
    #[error("validation error: {0}")]
    Validation(String),

    /// The broker client rejected the publish or is unreachable.
    #[error("publish to '{topic}' failed")]
    Publish { topic: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, Error>;
