use axum::http::StatusCode;

use crate::workitem::WorkitemValidationError;

/// Everything a request handler can fail with. The server front maps each
/// variant to a fixed HTTP status and a JSON body of the shape
/// `{"error": "<kind>", "message": "<detail>"}`.
#[derive(thiserror::Error, Debug)]
pub enum DicomWebError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("request body exceeds the configured limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("byte range starts at {start} but the object is {total} bytes long")]
    RangeNotSatisfiable { start: u64, total: u64 },

    #[error("{0}")]
    NotAcceptable(String),

    #[error("request rate limit exceeded, retry after {retry_after} seconds")]
    TooManyRequests { retry_after: u64 },

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Validation(#[from] WorkitemValidationError),
}

impl DicomWebError {
    /// The machine-readable `error` field of the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::UnsupportedMediaType(_) => "UnsupportedMediaType",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::RangeNotSatisfiable { .. } => "RangeNotSatisfiable",
            Self::NotAcceptable(_) => "NotAcceptable",
            Self::TooManyRequests { .. } => "TooManyRequests",
            Self::NotImplemented(_) => "NotImplemented",
            Self::Internal(_) => "Internal",
            Self::Validation(_) => "ValidationError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(e) => match e {
                WorkitemValidationError::MissingTransactionUid
                | WorkitemValidationError::FinalStateViolation => StatusCode::CONFLICT,
                WorkitemValidationError::EmptyWorkitemUid
                | WorkitemValidationError::InvalidField(_) => StatusCode::BAD_REQUEST,
            },
        }
    }

    /// The message surfaced to the client. Internal details are logged by the
    /// server front and replaced with a generic message here.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}
