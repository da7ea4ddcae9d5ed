use serde_json::json;
use thiserror::Error;
use warp::{http::StatusCode, reject::Reject, Reply};

/// Application-specific error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Database pool error: {0}")]
    DatabasePool(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Validation errors: {0}")]
    ValidationErrors(#[from] validator::ValidationErrors),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("No files were provided")]
    FilesRequired,

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("Analysis already in progress for session {0}")]
    AnalysisInProgress(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Report not found: {0}")]
    ReportNotFound(String),

    #[error("Upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("External API error: {0}")]
    ExternalApiError(String),

    #[error("Parser error: {0}")]
    ParserError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl Reject for AppError {}

impl AppError {
    /// Machine-readable error code surfaced to API clients
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::FilesRequired => "FILES_REQUIRED",
            AppError::FileTooLarge(_) => "FILE_TOO_LARGE",
            AppError::AnalysisInProgress(_) => "ANALYSIS_IN_PROGRESS",
            AppError::AnalysisFailed(_) => "ANALYSIS_FAILED",
            AppError::ReportNotFound(_) => "REPORT_NOT_FOUND",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::ValidationError(_) | AppError::ValidationErrors(_) | AppError::BadRequest(_) => {
                "BAD_REQUEST"
            }
            _ => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::FilesRequired => StatusCode::BAD_REQUEST,
            AppError::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::AnalysisInProgress(_) => StatusCode::CONFLICT,
            AppError::ReportNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ValidationError(_) | AppError::ValidationErrors(_) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::HttpClient(_)
            | AppError::ExternalApiError(_)
            | AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn internal_error<T: std::fmt::Display>(message: T) -> Self {
        AppError::InternalError(message.to_string())
    }

    pub fn validation_error<T: std::fmt::Display>(message: T) -> Self {
        AppError::ValidationError(message.to_string())
    }

    pub fn external_api_error<T: std::fmt::Display>(message: T) -> Self {
        AppError::ExternalApiError(message.to_string())
    }

    /// Log the error with appropriate level and context
    pub fn log_with_context(&self, context: &str) {
        match self {
            AppError::Database(_)
            | AppError::DatabasePool(_)
            | AppError::MigrationError(_)
            | AppError::ConfigError(_)
            | AppError::Io(_)
            | AppError::InternalError(_) => {
                tracing::error!("{} - {}", context, self);
            }
            AppError::HttpClient(_)
            | AppError::ExternalApiError(_)
            | AppError::UpstreamUnavailable(_)
            | AppError::AnalysisFailed(_) => {
                tracing::error!("{} - {}", context, self);
            }
            AppError::ReportNotFound(_) => {
                tracing::info!("{} - {}", context, self);
            }
            _ => {
                tracing::warn!("{} - {}", context, self);
            }
        }
    }
}

/// Convert AppError rejections (and warp's own) into the JSON error envelope
pub async fn handle_rejection(err: warp::Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let (status, code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NOT_FOUND", "Not Found".to_string())
    } else if let Some(app_error) = err.find::<AppError>() {
        app_error.log_with_context("Request rejected");
        (
            app_error.status_code(),
            app_error.error_code(),
            app_error.to_string(),
        )
    } else if err
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        tracing::warn!("Invalid request body: {:?}", err);
        (
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "Invalid request body".to_string(),
        )
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        tracing::warn!("Payload too large: {:?}", err);
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "FILE_TOO_LARGE",
            "Request body exceeds the configured limit".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "Method not allowed".to_string(),
        )
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error".to_string(),
        )
    };

    let body = warp::reply::json(&json!({
        "error": message,
        "code": code,
    }));

    Ok(warp::reply::with_status(body, status))
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Convert from bb8 pool error
impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for AppError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        AppError::DatabasePool(err.to_string())
    }
}

/// Convert from diesel migration error
impl From<diesel_migrations::MigrationError> for AppError {
    fn from(err: diesel_migrations::MigrationError) -> Self {
        AppError::MigrationError(err.to_string())
    }
}

/// Convert from chrono parse error
impl From<chrono::ParseError> for AppError {
    fn from(err: chrono::ParseError) -> Self {
        AppError::ParserError(err.to_string())
    }
}

/// Convert from uuid parse error
impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::ValidationError(format!("Invalid UUID: {}", err))
    }
}

/// Convert from bigdecimal parse error
impl From<bigdecimal::ParseBigDecimalError> for AppError {
    fn from(err: bigdecimal::ParseBigDecimalError) -> Self {
        AppError::ValidationError(format!("Invalid decimal: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_client_taxonomy() {
        assert_eq!(AppError::FilesRequired.error_code(), "FILES_REQUIRED");
        assert_eq!(
            AppError::FileTooLarge("a.pdf".into()).error_code(),
            "FILE_TOO_LARGE"
        );
        assert_eq!(
            AppError::AnalysisInProgress("s1".into()).error_code(),
            "ANALYSIS_IN_PROGRESS"
        );
        assert_eq!(
            AppError::ReportNotFound("s1".into()).error_code(),
            "REPORT_NOT_FOUND"
        );
        assert_eq!(
            AppError::UpstreamUnavailable("extractor".into()).error_code(),
            "UPSTREAM_UNAVAILABLE"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::FilesRequired.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::FileTooLarge("a.pdf".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            AppError::AnalysisInProgress("s1".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::ReportNotFound("s1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::UpstreamUnavailable("llm".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
