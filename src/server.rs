use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::dispatcher::SubmitError;
use crate::error::WorkerError;
use crate::health::HealthChecker;
use crate::types::JobDescriptor;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub struct HealthServer {
    health_checker: Arc<HealthChecker>,
    addr: SocketAddr,
}

impl HealthServer {
    pub fn new(health_checker: Arc<HealthChecker>, addr: SocketAddr) -> Self {
        Self { health_checker, addr }
    }

    pub async fn start(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "health server listening");
        Self::serve(listener, Arc::clone(&self.health_checker)).await
    }

    pub async fn serve(listener: TcpListener, health_checker: Arc<HealthChecker>) -> std::io::Result<()> {
        loop {
            let (mut socket, peer) = listener.accept().await?;
            let health_checker = Arc::clone(&health_checker);

            tokio::spawn(async move {
                let mut buffer = Vec::with_capacity(2048);
                let mut chunk = [0; 2048];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            debug!(%peer, error = %e, "health request read failed");
                            return;
                        }
                    }
                    if request_complete(&buffer) || buffer.len() >= MAX_REQUEST_BYTES {
                        break;
                    }
                }
                if buffer.is_empty() {
                    return;
                }

                let request = String::from_utf8_lossy(&buffer);
                let response = Self::handle_request(&request, &health_checker).await;

                if let Err(e) = socket.write_all(response.as_bytes()).await {
                    debug!(%peer, error = %e, "health response write failed");
                }
            });
        }
    }

    pub async fn handle_request(request: &str, health_checker: &HealthChecker) -> String {
        let Some(request_line) = request.lines().next() else {
            return Self::error_response(400, "Bad Request");
        };
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 2 {
            return Self::error_response(400, "Bad Request");
        }

        let method = parts[0];
        let path = parts[1].split('?').next().unwrap_or_default();

        match (method, path) {
            ("GET", "/health") => Self::to_json(&health_checker.get_health()),
            ("GET", "/status") => Self::to_json(&health_checker.get_detailed_status()),
            ("POST", "/submit") => Self::submit(request, health_checker),
            ("GET", "/metrics") => match health_checker.export_prometheus() {
                Some(Ok(text)) => Self::response(200, "text/plain; version=0.0.4", &text),
                Some(Err(e)) => {
                    error!(error = %e, "prometheus encoding failed");
                    Self::error_response(500, "Internal Server Error")
                }
                None => Self::to_json(&health_checker.get_metrics()),
            },
            ("GET", p) if p.starts_with("/proof/") => {
                let job_id = &p["/proof/".len()..];
                match health_checker.get_proof(job_id).await {
                    Ok(proof) => Self::to_json(&proof),
                    Err(WorkerError::NotFound(_)) => Self::error_response(404, "Not Found"),
                    Err(WorkerError::InvalidJob(_)) => Self::error_response(400, "Bad Request"),
                    Err(e) => {
                        error!(job_id, error = %e, "proof lookup failed");
                        Self::error_response(500, "Internal Server Error")
                    }
                }
            }
            _ => Self::error_response(404, "Not Found"),
        }
    }

    fn submit(request: &str, health_checker: &HealthChecker) -> String {
        let body = request.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default();
        let job: JobDescriptor = match serde_json::from_str(body) {
            Ok(job) => job,
            Err(e) => {
                debug!(error = %e, "unparseable submit body");
                return Self::error_response(400, "Bad Request");
            }
        };
        let Some(model) = job.model.clone() else {
            return Self::error_response(400, "model is required");
        };

        let job_id = job.job_id.clone();
        match health_checker.submit(&model, job) {
            // The job task runs on; dropping the handle detaches it.
            Ok((slot, _handle)) => {
                let body = serde_json::json!({ "job_id": job_id, "slot": slot }).to_string();
                Self::response(202, "application/json", &body)
            }
            Err(SubmitError::UnknownModel(_)) => Self::error_response(404, "Not Found"),
            Err(SubmitError::Busy(e)) => Self::error_response(409, &e.to_string()),
            Err(SubmitError::Rejected(WorkerError::DuplicateJob(_))) => Self::error_response(409, "Conflict"),
            Err(SubmitError::Rejected(WorkerError::InvalidJob(_))) => Self::error_response(400, "Bad Request"),
            Err(SubmitError::ShuttingDown) => Self::error_response(503, "Service Unavailable"),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "submit failed");
                Self::error_response(500, "Internal Server Error")
            }
        }
    }

    fn to_json<T: serde::Serialize>(value: &T) -> String {
        match serde_json::to_string(value) {
            Ok(json) => Self::response(200, "application/json", &json),
            Err(_) => Self::error_response(500, "Internal Server Error"),
        }
    }

    fn response(status: u16, content_type: &str, body: &str) -> String {
        let reason = match status {
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            404 => "Not Found",
            409 => "Conflict",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            content_type,
            body.len(),
            body
        )
    }

    fn error_response(status: u16, message: &str) -> String {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::response(status, "application/json", &body)
    }
}

/// Headers are in and any `Content-Length` body has fully arrived.
fn request_complete(buffer: &[u8]) -> bool {
    let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&buffer[..end]);
    let content_length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    buffer.len() >= end + 4 + content_length
}
