//! Client for the visual grounding sidecar.
//!
//! The sidecar is a local HTTP service that takes a window capture and a free-text
//! description and answers with the point it believes matches. It is started on
//! demand and shuts itself down after an idle period.

use crate::config::VisionConfig;
use crate::errors::AutomationError;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_millis(1_500);
const STARTUP_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundRequest {
    /// Base64-encoded PNG
    pub image: String,
    pub description: String,
    /// Logical size of the captured area, in points
    pub screen_w: f64,
    pub screen_h: f64,
    /// `[x1, y1, x2, y2]` in logical points
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_box: Option<[f64; 4]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundResponse {
    /// Logical position inside the captured area
    pub x: f64,
    pub y: f64,
    pub normalized_x: Option<f64>,
    pub normalized_y: Option<f64>,
    pub confidence: f64,
    pub raw: String,
    pub inference_ms: u64,
    pub method: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub models_loaded: Vec<String>,
    pub model_path: Option<String>,
    pub model_exists: bool,
    pub vlm_load_error: Option<String>,
    pub idle_timeout: u64,
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    detail: Option<String>,
}

#[async_trait::async_trait]
pub trait GroundingPeer: Send + Sync {
    async fn ground(&self, request: GroundRequest) -> Result<GroundResponse, AutomationError>;
}

pub struct GroundingClient {
    http: reqwest::Client,
    base_url: String,
    port: u16,
    launch_command: Vec<String>,
    idle_timeout_secs: u64,
    startup_wait: Duration,
    launched: AtomicBool,
}

impl GroundingClient {
    pub fn new(config: &VisionConfig, port: u16) -> Result<Self, AutomationError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AutomationError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            port,
            launch_command: config.launch_command.clone(),
            idle_timeout_secs: config.idle_timeout_secs,
            startup_wait: Duration::from_millis(config.startup_wait_ms),
            launched: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus, AutomationError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| AutomationError::PeerUnavailable(format!("grounding service: {e}")))?;
        if !response.status().is_success() {
            return Err(AutomationError::PeerUnavailable(format!(
                "grounding health check returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AutomationError::PeerUnavailable(format!("unreadable health reply: {e}")))
    }

    /// Makes sure the sidecar answers, launching it once if a command is configured.
    #[instrument(skip(self), fields(url = %self.base_url))]
    pub async fn ensure_running(&self) -> Result<HealthStatus, AutomationError> {
        if let Ok(health) = self.health().await {
            return Ok(health);
        }
        let Some((program, args)) = self.launch_command.split_first() else {
            return Err(AutomationError::PeerUnavailable(format!(
                "grounding service not running at {} and no launch command configured",
                self.base_url
            )));
        };
        if !self.launched.swap(true, Ordering::SeqCst) {
            info!(program = %program, port = self.port, "starting grounding service");
            tokio::process::Command::new(program)
                .args(args)
                .arg("--port")
                .arg(self.port.to_string())
                .arg("--idle-timeout")
                .arg(self.idle_timeout_secs.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| {
                    self.launched.store(false, Ordering::SeqCst);
                    AutomationError::PeerUnavailable(format!("cannot start {program}: {e}"))
                })?;
        }

        let start = Instant::now();
        while start.elapsed() < self.startup_wait {
            tokio::time::sleep(STARTUP_POLL).await;
            match self.health().await {
                Ok(health) => {
                    info!(
                        duration_ms = start.elapsed().as_millis(),
                        status = %health.status,
                        "grounding service is up"
                    );
                    return Ok(health);
                }
                Err(e) => debug!(error = %e, "grounding service not answering yet"),
            }
        }
        // A later call may launch again once this one has given up.
        self.launched.store(false, Ordering::SeqCst);
        Err(AutomationError::PeerUnavailable(format!(
            "grounding service did not come up within {:?}",
            self.startup_wait
        )))
    }
}

#[async_trait::async_trait]
impl GroundingPeer for GroundingClient {
    #[instrument(skip(self, request), fields(description = %request.description))]
    async fn ground(&self, request: GroundRequest) -> Result<GroundResponse, AutomationError> {
        self.ensure_running().await?;
        let start = Instant::now();
        let response = self
            .http
            .post(format!("{}/ground", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| AutomationError::PeerUnavailable(format!("grounding request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ErrorBody>().await.ok();
            let message = body
                .map(|b| match (b.error, b.detail) {
                    (Some(error), Some(detail)) => format!("{error}: {detail}"),
                    (Some(error), None) => error,
                    (None, Some(detail)) => detail,
                    (None, None) => status.to_string(),
                })
                .unwrap_or_else(|| status.to_string());
            warn!(status = status.as_u16(), %message, "grounding request rejected");
            return Err(match status.as_u16() {
                400 => AutomationError::InvalidArgument(message),
                503 => AutomationError::PeerUnavailable(message),
                _ => AutomationError::ExecutionFailed(format!("grounding failed: {message}")),
            });
        }

        let grounded: GroundResponse = response
            .json()
            .await
            .map_err(|e| AutomationError::ExecutionFailed(format!("unreadable grounding reply: {e}")))?;
        info!(
            confidence = grounded.confidence,
            inference_ms = grounded.inference_ms,
            duration_ms = start.elapsed().as_millis(),
            "grounding finished"
        );
        Ok(grounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A healthy sidecar whose `/ground` answers with the given status line and body.
    async fn serve(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let request = read_request(&mut stream).await;
                    let (status, body) = if request.starts_with("GET /health") {
                        ("200 OK", r#"{"status":"ready","models_loaded":["grounder"]}"#)
                    } else {
                        (status, body)
                    };
                    let reply = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(n) if n > 0 => n,
                _ => return String::from_utf8_lossy(&buf).into_owned(),
            };
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return text.into_owned();
                }
            }
        }
    }

    fn client(port: u16) -> GroundingClient {
        let config = VisionConfig {
            url: format!("http://127.0.0.1:{port}"),
            ..VisionConfig::default()
        };
        GroundingClient::new(&config, port).unwrap()
    }

    fn request() -> GroundRequest {
        GroundRequest {
            image: "iVBORw0KGgo=".to_string(),
            description: "Send button".to_string(),
            screen_w: 800.0,
            screen_h: 600.0,
            crop_box: None,
        }
    }

    #[tokio::test]
    async fn parses_a_grounding_reply() {
        let port = serve(
            "200 OK",
            r#"{"status":"ready","x":400.0,"y":150.0,"normalized_x":0.5,"normalized_y":0.25,"confidence":0.8,"raw":"[0.5, 0.25]","inference_ms":900,"method":"full-screen"}"#,
        )
        .await;
        let reply = client(port).ground(request()).await.unwrap();
        assert_eq!(reply.normalized_x, Some(0.5));
        assert_eq!(reply.confidence, 0.8);
        assert_eq!(reply.method.as_deref(), Some("full-screen"));
    }

    #[tokio::test]
    async fn model_load_failure_means_peer_unavailable() {
        let port = serve(
            "503 Service Unavailable",
            r#"{"error":"model failed to load","detail":"missing weights"}"#,
        )
        .await;
        let err = client(port).ground(request()).await.unwrap_err();
        assert_eq!(
            err,
            AutomationError::PeerUnavailable("model failed to load: missing weights".to_string())
        );
    }

    #[tokio::test]
    async fn nothing_listening_and_no_launcher_is_unavailable() {
        let err = client(1).ensure_running().await.unwrap_err();
        assert!(matches!(err, AutomationError::PeerUnavailable(_)));
    }
}
