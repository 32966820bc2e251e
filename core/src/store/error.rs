// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Store error types.

use thiserror::Error;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQL execution error
    #[error("SQL error: {0}")]
    Sql(sqlx::Error),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Completion reported by a worker that does not own the batch
    #[error("Not assigned: {0}")]
    NotAssigned(String),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

impl StoreError {
    /// Check if error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if error is an ownership conflict
    pub fn is_not_assigned(&self) -> bool {
        matches!(self, Self::NotAssigned(_))
    }
}

/// Convert sqlx row-not-found to our NotFound error
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            _ => Self::Sql(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let err = StoreError::NotFound("job x".to_string());
        assert!(err.is_not_found());
        assert!(!err.is_not_assigned());

        let err = StoreError::NotAssigned("batch y".to_string());
        assert!(err.is_not_assigned());
    }

    #[test]
    fn test_row_not_found_conversion() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }
}
