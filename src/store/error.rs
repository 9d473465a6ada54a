#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Corrupt(value.to_string())
    }
}

impl From<uuid::Error> for StoreError {
    fn from(value: uuid::Error) -> Self {
        Self::Corrupt(value.to_string())
    }
}

impl From<chrono::ParseError> for StoreError {
    fn from(value: chrono::ParseError) -> Self {
        Self::Corrupt(value.to_string())
    }
}

impl From<crate::model::InvalidJobStatus> for StoreError {
    fn from(value: crate::model::InvalidJobStatus) -> Self {
        Self::Corrupt(value.to_string())
    }
}
