use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use insureflow_core::errors::StoreError;

pub mod escalation;
pub mod session;

pub use escalation::SqlEscalationQueue;
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("row `{0}` changed while it was being updated")]
    Conflict(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Conflict(session_id) => StoreError::Conflict(session_id.into()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_json<T: DeserializeOwned>(column: &str, value: String) -> Result<T, RepositoryError> {
    serde_json::from_str(&value)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}` ({error})")))
}

pub(crate) fn encode_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}` ({error})")))
}

pub(crate) fn parse_count<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, RepositoryError> {
    T::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("value {value} out of range in `{column}`")))
}

pub(crate) fn encode_count<T: TryInto<i64>>(column: &str, value: T) -> Result<i64, RepositoryError> {
    value
        .try_into()
        .map_err(|_| RepositoryError::Decode(format!("value out of range for `{column}`")))
}
