use serde::Serialize;
use thiserror::Error;

/// Common error type for tokenflow with clear taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Client request errors (4xx)
    #[error("{message}")]
    InvalidParameter { param: String, message: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("The model `{0}` does not exist.")]
    ModelNotFound(String),

    #[error("Unsupported message content: {0}")]
    UnsupportedContent(String),

    /// Cancellation and disconnects
    #[error("Client disconnected")]
    Disconnected,

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Upstream generation errors
    #[error("Backend error: {0}")]
    Backend(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO and serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic anyhow error for flexibility
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Get HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            // 4xx Client Errors
            Error::InvalidParameter { .. } => 400,
            Error::BadRequest(_) => 400,
            Error::UnsupportedContent(_) => 400,
            Error::ModelNotFound(_) => 404,

            // Disconnects surface as a client error on the aggregated path
            Error::Disconnected => 400,
            Error::Cancelled(_) => 499,

            // 5xx Server Errors
            Error::Backend(_) => 500,
            Error::Internal(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::Http(_) => 502,
            Error::Anyhow(_) => 500,
        }
    }

    /// OpenAI-style error type string for the wire body
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidParameter { .. } => "invalid_request_error",
            Error::BadRequest(_) => "invalid_request_error",
            Error::UnsupportedContent(_) => "invalid_request_error",
            Error::ModelNotFound(_) => "NotFoundError",
            Error::Disconnected => "invalid_request_error",
            Error::Cancelled(_) => "cancelled",
            Error::Backend(_) => "server_error",
            Error::Internal(_) => "server_error",
            Error::Io(_) => "server_error",
            Error::Serialization(_) => "server_error",
            Error::Http(_) => "server_error",
            Error::Anyhow(_) => "server_error",
        }
    }

    /// Offending parameter name, when the error names one
    pub fn param(&self) -> Option<&str> {
        match self {
            Error::InvalidParameter { param, .. } => Some(param),
            _ => None,
        }
    }
}

/// Flat OpenAI error body: `{object, message, type, param, code}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub object: &'static str,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: u16,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        ErrorResponse {
            object: "error",
            message: err.to_string(),
            error_type: err.error_type().to_string(),
            param: err.param().map(str::to_string),
            code: err.status_code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
