// Error taxonomy surfaced to API clients as {error:{code,message}}.

use http::StatusCode;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid credentials")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        GatewayError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::Store(_) | GatewayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Store(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<redb::TransactionError> for GatewayError {
    fn from(e: redb::TransactionError) -> Self {
        GatewayError::Store(e.into())
    }
}

impl From<redb::TableError> for GatewayError {
    fn from(e: redb::TableError) -> Self {
        GatewayError::Store(e.into())
    }
}

impl From<redb::StorageError> for GatewayError {
    fn from(e: redb::StorageError) -> Self {
        GatewayError::Store(e.into())
    }
}

impl From<redb::CommitError> for GatewayError {
    fn from(e: redb::CommitError) -> Self {
        GatewayError::Store(e.into())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Store(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_codes_and_statuses() {
        let err = GatewayError::validation("amount must be positive");
        assert_eq!(err.code(), "validation");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = GatewayError::conflict("order already paid");
        assert_eq!(err.code(), "conflict");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        assert_eq!(GatewayError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::NotFound("order").to_string(), "order not found");
    }
}
