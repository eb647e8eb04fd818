//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type shared by every response the gateway produces
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for responses generated by the gateway itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No handler claimed the request
    RouteNotFound,
    /// A session path was requested without a websocket upgrade
    UpgradeRequired,
    /// The local service behind `/_proxy/<port>` could not be reached
    LocalServiceUnreachable,
    /// The kernel server could not be reached while forwarding
    ConnectionFailed,
    /// The upstream did not answer in time
    RequestTimeout,
    /// Unexpected failure inside the gateway
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            GatewayErrorCode::LocalServiceUnreachable => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::ConnectionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::UpgradeRequired => "UPGRADE_REQUIRED",
            GatewayErrorCode::LocalServiceUnreachable => "LOCAL_SERVICE_UNREACHABLE",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a response with the given status and no body
pub fn empty_response(status: StatusCode) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Errors raised while launching or managing the kernel server process
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no free port available at or above {0}")]
    NoFreePort(u16),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that end a client session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid kernel url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("malformed client message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("terminal error: {0}")]
    Terminal(String),
}
