use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Entity absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Business-rule violation (self-borrow, approving before return, wrong actor).
    #[error("Operation not permitted: {0}")]
    InvalidOperation(String),

    /// The user already holds an unapproved borrow of this book.
    #[error("Book already borrowed: {0}")]
    AlreadyBorrowed(String),

    /// The book is archived or not shareable.
    #[error("Book unavailable: {0}")]
    BookUnavailable(String),

    /// Request payload failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unique value already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Wrong login or activation credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No valid session token on the request.
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// Account is locked.
    #[error("Account locked")]
    AccountLocked,

    /// Account has not been activated.
    #[error("Account disabled")]
    AccountDisabled,

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Image decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Tag identifying the class of an [`AppError`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// See [`AppError::NotFound`].
    NotFound,
    /// See [`AppError::InvalidOperation`].
    InvalidOperation,
    /// See [`AppError::AlreadyBorrowed`].
    AlreadyBorrowed,
    /// See [`AppError::BookUnavailable`].
    BookUnavailable,
    /// See [`AppError::Validation`].
    Validation,
    /// See [`AppError::Conflict`].
    Conflict,
    /// See [`AppError::Unauthorized`].
    BadCredentials,
    /// See [`AppError::Unauthenticated`].
    Unauthenticated,
    /// See [`AppError::AccountLocked`].
    AccountLocked,
    /// See [`AppError::AccountDisabled`].
    AccountDisabled,
    /// Everything the caller cannot act on.
    Internal,
}

/// Transport mapping: kind, HTTP status, business error code, description.
const ERROR_TABLE: &[(ErrorKind, StatusCode, u16, &str)] = &[
    (ErrorKind::NotFound, StatusCode::NOT_FOUND, 404, "Resource not found"),
    (ErrorKind::InvalidOperation, StatusCode::BAD_REQUEST, 400, "Operation not permitted"),
    (ErrorKind::AlreadyBorrowed, StatusCode::CONFLICT, 409, "Book already borrowed"),
    (ErrorKind::BookUnavailable, StatusCode::BAD_REQUEST, 410, "Book is archived or not shareable"),
    (ErrorKind::Validation, StatusCode::BAD_REQUEST, 422, "Invalid request"),
    (ErrorKind::Conflict, StatusCode::CONFLICT, 409, "Resource already exists"),
    (ErrorKind::Unauthenticated, StatusCode::UNAUTHORIZED, 401, "Authentication required"),
    (ErrorKind::BadCredentials, StatusCode::UNAUTHORIZED, 304, "Login and / or password is incorrect"),
    (ErrorKind::AccountLocked, StatusCode::UNAUTHORIZED, 302, "User account is locked"),
    (ErrorKind::AccountDisabled, StatusCode::UNAUTHORIZED, 303, "User account is disabled"),
    (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR, 500, "Internal error, please contact the admin"),
];

impl ErrorKind {
    fn entry(self) -> (StatusCode, u16, &'static str) {
        ERROR_TABLE
            .iter()
            .find(|(kind, ..)| *kind == self)
            .map(|(_, status, code, description)| (*status, *code, *description))
            .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, 500, "Internal error"))
    }

    /// HTTP status for this kind.
    pub fn status(self) -> StatusCode {
        self.entry().0
    }

    /// Numeric business error code for this kind.
    pub fn code(self) -> u16 {
        self.entry().1
    }
}

impl AppError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            AppError::AlreadyBorrowed(_) => ErrorKind::AlreadyBorrowed,
            AppError::BookUnavailable(_) => ErrorKind::BookUnavailable,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Unauthorized(_) => ErrorKind::BadCredentials,
            AppError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            AppError::AccountLocked => ErrorKind::AccountLocked,
            AppError::AccountDisabled => ErrorKind::AccountDisabled,
            AppError::Io(_)
            | AppError::Database(_)
            | AppError::Image(_)
            | AppError::Config(_)
            | AppError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    kind: ErrorKind,
    description: &'static str,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, code, description) = kind.entry();

        // Internal details stay in the log.
        let error = if kind == ErrorKind::Internal {
            tracing::error!(error = %self, "Request error");
            description.to_string()
        } else {
            tracing::debug!(error = %self, ?kind, "Request rejected");
            self.to_string()
        };

        let body = ErrorBody {
            code,
            kind,
            description,
            error,
        };

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
