use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Bus is stopped")]
    Stopped,

    #[error("AWS SQS error: {0}")]
    Sqs(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for BusError {
    fn from(e: sqlx::Error) -> Self {
        BusError::Database(e.to_string())
    }
}
