use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("completion already recorded for {0}")]
    Duplicate(String),
    #[error("completion store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
