use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid format error.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image processing error.
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An external program could not be run or exited unsuccessfully.
    #[error("`{program}` failed: {message}")]
    Command {
        /// Program that was invoked.
        program: String,
        /// What went wrong.
        message: String,
    },

    /// A library entry carried unusable author information.
    #[error("could not parse authors of {title}: {detail}")]
    Authors {
        /// Title of the offending book.
        title: String,
        /// Description of the problem.
        detail: String,
    },

    /// The updater's output did not contain a metadata block.
    ///
    /// The raw output is kept for diagnosis but is not part of the message.
    #[error("could not read JSON output when updating {path}")]
    Protocol {
        /// File the updater was run against.
        path: String,
        /// Complete standard output of the updater.
        output: String,
    },

    /// The updater's metadata block could not be decoded.
    #[error("could not read output metadata: {source}")]
    Metadata {
        /// Underlying decode error.
        source: serde_json::Error,
        /// Raw payload, for post-mortem inspection.
        payload: String,
    },

    /// Writing metadata back into the library failed.
    #[error("could not update database for book #{id}: {source}")]
    UpdateBook {
        /// Library id of the book.
        id: i64,
        /// Underlying failure.
        source: Box<AppError>,
    },

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(error = %self, "Request error");

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
