//! Forwarding proxy bound to one upstream address
//!
//! Plain requests go through the shared [`ConnectionPool`]. Upgrade requests
//! are replayed on a fresh TCP connection and, once the upstream answers
//! `101 Switching Protocols`, both sides are spliced together.

use crate::error::{empty_response, json_error_response, GatewayBody, GatewayErrorCode};
use crate::pool::ConnectionPool;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Upper bound on the size of an upstream upgrade response head
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// Forwarding proxy for a single upstream host and port
pub struct UpstreamProxy {
    host: String,
    port: u16,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(host: impl Into<String>, port: u16, pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            pool,
            request_timeout,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward a plain HTTP request and return the upstream response
    pub async fn forward(&self, req: Request<Incoming>) -> Response<GatewayBody> {
        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, &self.host, self.port),
        )
        .await;

        match result {
            Ok(Ok(mut response)) => {
                strip_wildcard_cors(response.headers_mut());
                response
            }
            Ok(Err(e)) => {
                error!(host = %self.host, port = self.port, error = %e, "Failed to forward request to kernel server");
                let mut response = json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Failed to connect to kernel server",
                );
                strip_wildcard_cors(response.headers_mut());
                response
            }
            Err(_) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request to kernel server timed out"
                );
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

    /// Forward a protocol upgrade and splice the connections once accepted
    pub async fn forward_upgrade(&self, req: Request<Incoming>, request_id: String) -> Response<GatewayBody> {
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(request_id, upgrade_type, path = req.uri().path(), "Forwarding upgrade request");

        let raw_request = build_upgrade_request(&req, &self.host, self.port);

        let backend_addr = format!("{}:{}", self.host, self.port);
        let mut backend_stream = match TcpStream::connect(&backend_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(addr = %backend_addr, error = %e, "Failed to connect to kernel server for upgrade");
                return json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Failed to connect to kernel server",
                );
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            error!(addr = %backend_addr, error = %e, "Failed to send upgrade request");
            return json_error_response(
                GatewayErrorCode::ConnectionFailed,
                "Failed to send upgrade request",
            );
        }

        let (head, leftover) = match read_response_head(&mut backend_stream).await {
            Ok(parts) => parts,
            Err(e) => {
                error!(addr = %backend_addr, error = %e, "Failed to read upgrade response");
                return json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Invalid upgrade response from kernel server",
                );
            }
        };

        let (status, response_headers) = match parse_upgrade_response(&head) {
            Some(parsed) => parsed,
            None => {
                error!(addr = %backend_addr, "Failed to parse upgrade response");
                return json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Invalid upgrade response from kernel server",
                );
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(addr = %backend_addr, status = %status, "Kernel server rejected upgrade request");
            let mut response = empty_response(status);
            copy_response_headers(response.headers_mut(), &response_headers);
            strip_wildcard_cors(response.headers_mut());
            return response;
        }

        info!(request_id, upgrade_type, "Upgrade accepted by kernel server");

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .body(http_body_util::Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");
        copy_response_headers(response.headers_mut(), &response_headers);

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    splice(upgraded, backend_stream, leftover, &request_id).await;
                }
                Err(e) => {
                    error!(request_id, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Remove an `Access-Control-Allow-Origin: *` header
///
/// The kernel server is known to attach a wildcard origin in some error
/// paths; it must not reach browsers through the gateway.
pub fn strip_wildcard_cors(headers: &mut HeaderMap) {
    let wildcard = headers
        .get_all(ACCESS_CONTROL_ALLOW_ORIGIN)
        .iter()
        .any(|v| v.to_str().map(|s| s.trim() == "*").unwrap_or(false));
    if wildcard {
        headers.remove(ACCESS_CONTROL_ALLOW_ORIGIN);
    }
}

/// Check if a request asks for a protocol upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

fn copy_response_headers(target: &mut HeaderMap, headers: &[(String, String)]) {
    for (name, value) in headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            target.append(name, value);
        }
    }
}

async fn splice(client: Upgraded, mut backend: TcpStream, leftover: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(request_id, error = %e, "Client went away before buffered upstream bytes were delivered");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send upstream
fn build_upgrade_request<B>(req: &Request<B>, host: &str, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}:{}\r\n", host, port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read up to the end of the response head; returns the head and any bytes after it
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the status line and headers of an upgrade response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}
