//! Forwarding of `/_proxy/<port>/...` requests to services on this host
//!
//! Stateless: every request is matched, rewritten and forwarded on its own.

use crate::error::{json_error_response, GatewayBody, GatewayErrorCode};
use crate::pool::ConnectionPool;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Path segment that addresses a local service by port
const PROXY_SEGMENT: &str = "/_proxy/";

/// Host local services are reached on
const LOCAL_HOST: &str = "localhost";

/// Port addressed by the first `/_proxy/<port>` segment of `path`, or 0.
///
/// The digits must be followed by `/` or the end of the path and must form a
/// non-zero `u16`.
pub fn get_request_port(path: &str) -> u16 {
    find_proxy_segment(path).map(|(port, _, _)| port).unwrap_or(0)
}

/// Returns the port and the byte range of the matched `/_proxy/<port>` segment
fn find_proxy_segment(path: &str) -> Option<(u16, usize, usize)> {
    let mut offset = 0;
    while let Some(found) = path[offset..].find(PROXY_SEGMENT) {
        let start = offset + found;
        let digits_start = start + PROXY_SEGMENT.len();
        let digits_len = path[digits_start..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let end = digits_start + digits_len;
        let terminated = path[end..].is_empty() || path[end..].starts_with('/');

        if digits_len > 0 && terminated {
            let port = path[digits_start..end].parse::<u16>().unwrap_or(0);
            return if port == 0 { None } else { Some((port, start, end)) };
        }
        offset = start + 1;
    }
    None
}

/// Remove the `/_proxy/<port>` segment, keeping the rest of the path and query
pub fn strip_proxy_segment(uri: &Uri) -> String {
    let path = uri.path();
    let mut stripped = match find_proxy_segment(path) {
        Some((_, start, end)) => format!("{}{}", &path[..start], &path[end..]),
        None => path.to_string(),
    };
    if stripped.is_empty() {
        stripped.push('/');
    }
    if let Some(query) = uri.query() {
        stripped.push('?');
        stripped.push_str(query);
    }
    stripped
}

/// Forwards requests to `http://localhost:<port>`
pub struct ReverseProxyDispatcher {
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl ReverseProxyDispatcher {
    pub fn new(pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self { pool, request_timeout }
    }

    pub async fn handle_request(&self, req: Request<Incoming>, port: u16) -> Response<GatewayBody> {
        let target = strip_proxy_segment(req.uri());
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(path = %target, error = %e, "Invalid rewritten proxy path");
                return unreachable_response();
            }
        };

        debug!(port, path = %target, "Forwarding to local service");

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        let req = Request::from_parts(parts, body);

        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req, LOCAL_HOST, port)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(port, error = %e, "Local service unreachable");
                unreachable_response()
            }
            Err(_) => {
                warn!(port, timeout_secs = self.request_timeout.as_secs(), "Local service timed out");
                json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

fn unreachable_response() -> Response<GatewayBody> {
    json_error_response(
        GatewayErrorCode::LocalServiceUnreachable,
        "Failed to reach local service",
    )
}
