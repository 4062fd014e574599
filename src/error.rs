use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

/// Application-wide error types.
#[derive(Error, Debug)]
pub enum StateraError {
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("failed to decode urlencoded data: {0}")]
    FormDecode(#[from] serde_urlencoded::de::Error),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid CIDR range: {0}")]
    Cidr(#[from] ipnet::AddrParseError),

    #[error("invalid operation for condition type")]
    InvalidOperation,

    #[error("client address missing from request")]
    MissingClientAddr,

    #[error("there is no node available on the group")]
    NoNodeAvailable,

    #[error("there is no node group on the evaluation context")]
    MissingEvaluation,

    #[error("node group {0} from the evaluation context not found on router")]
    UnknownNodeGroup(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateraError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            StateraError::BodyRead(_)
            | StateraError::FormDecode(_)
            | StateraError::Regex(_)
            | StateraError::Cidr(_)
            | StateraError::InvalidOperation
            | StateraError::MissingClientAddr
            | StateraError::NoNodeAvailable
            | StateraError::Upstream(_) => StatusCode::BAD_GATEWAY,
            StateraError::MissingEvaluation
            | StateraError::UnknownNodeGroup(_)
            | StateraError::Tls(_)
            | StateraError::Internal(_)
            | StateraError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the client. Internal detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            StateraError::BodyRead(_)
            | StateraError::FormDecode(_)
            | StateraError::Regex(_)
            | StateraError::Cidr(_)
            | StateraError::InvalidOperation
            | StateraError::MissingClientAddr => "rule evaluation failed",
            StateraError::NoNodeAvailable | StateraError::Upstream(_) => "bad gateway",
            StateraError::MissingEvaluation
            | StateraError::UnknownNodeGroup(_)
            | StateraError::Tls(_)
            | StateraError::Internal(_)
            | StateraError::Io(_) => "",
        }
    }
}

impl IntoResponse for StateraError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), self.public_message())
    }
}

/// Standard error page. Every user-facing error of the application goes through
/// here so clients always see the same HTML shape.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = format!(
        "<html><body><h1>There was a problem</h1><h3>{message}</h3></body></html>"
    );
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html")
        .body(Body::from(body))
        .unwrap_or_else(|e| {
            error!("failed to build error response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

pub type Result<T> = std::result::Result<T, StateraError>;
