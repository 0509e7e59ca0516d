//! Research providers: whatever actually performs a job's research.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use botfleet_core::{OrchestratorConfig, ResearchJob};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// What a provider returns for a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOutput {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub candidates_created: u32,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying: network errors, 5xx.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Retrying will not help: bad request, auth, malformed response.
    #[error("provider error: {0}")]
    Persistent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn execute(&self, job: &ResearchJob) -> Result<ProviderOutput, ProviderError>;

    fn name(&self) -> &str;
}

/// Logs the job and returns an empty, free result.
pub struct DryRunProvider;

#[async_trait]
impl ResearchProvider for DryRunProvider {
    async fn execute(&self, job: &ResearchJob) -> Result<ProviderOutput, ProviderError> {
        debug!("Dry run {} job {} ({})", job.mode, job.id, job.subject);
        Ok(ProviderOutput {
            result: json!({ "dryRun": true }),
            candidates_created: 0,
            cost_usd: 0.0,
        })
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}

/// JSON-over-HTTP provider. Posts each job to `{base_url}/research`.
pub struct HttpResearchProvider {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpResearchProvider {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Persistent(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/research", base_url.trim_end_matches('/')),
            auth_token,
        })
    }
}

#[async_trait]
impl ResearchProvider for HttpResearchProvider {
    async fn execute(&self, job: &ResearchJob) -> Result<ProviderOutput, ProviderError> {
        let body = json!({
            "jobId": job.id,
            "mode": job.mode,
            "subject": job.subject,
            "params": job.params,
            "costClass": job.cost_class,
            "attempt": job.attempts,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                ProviderError::Transient(format!("Request failed: {}", e))
            } else {
                ProviderError::Persistent(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry_after_ms(response.headers()),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("API error {}: {}", status, text);
            return Err(if status.is_server_error() {
                ProviderError::Transient(message)
            } else {
                ProviderError::Persistent(message)
            });
        }

        response
            .json::<ProviderOutput>()
            .await
            .map_err(|e| ProviderError::Persistent(format!("Malformed response: {}", e)))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// `Retry-After` in delta-seconds form, as milliseconds. HTTP-date values are ignored.
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(secs.saturating_mul(1000))
}

/// HTTP provider when a URL is configured, dry run otherwise.
pub fn create_provider(config: &OrchestratorConfig) -> Arc<dyn ResearchProvider> {
    let Some(url) = config.provider_url.as_deref() else {
        info!("No provider URL configured, running in dry-run mode");
        return Arc::new(DryRunProvider);
    };

    let auth_token = config
        .provider_auth_token_env
        .as_deref()
        .and_then(|key| std::env::var(key).ok())
        .filter(|token| !token.trim().is_empty());

    match HttpResearchProvider::new(url, auth_token, config.job_timeout()) {
        Ok(provider) => {
            info!("Research provider: {}", url);
            Arc::new(provider)
        }
        Err(e) => {
            warn!("Failed to build HTTP provider ({}), falling back to dry run", e);
            Arc::new(DryRunProvider)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_core::{JobTrigger, ResearchMode, WorkUnit};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        let limited = ProviderError::RateLimited {
            retry_after_ms: Some(5_000),
        };
        assert!(limited.is_transient());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));
        assert!(!ProviderError::Persistent("400".into()).is_transient());
        assert_eq!(ProviderError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn test_output_defaults() {
        let output: ProviderOutput = serde_json::from_str(r#"{"costUsd": 0.12}"#).unwrap();
        assert_eq!(output.candidates_created, 0);
        assert_eq!(output.cost_usd, 0.12);
    }

    #[tokio::test]
    async fn test_dry_run_is_free() {
        let work = WorkUnit {
            mode: ResearchMode::SentimentBurst,
            trigger: JobTrigger::Manual,
            subject: "btc".into(),
            params: serde_json::Value::Null,
            priority: 80,
            scheduled_for: None,
        };
        let job = ResearchJob::queued("j1".into(), &work, 0.05, chrono::Utc::now());
        let output = DryRunProvider.execute(&job).await.unwrap();
        assert_eq!(output.cost_usd, 0.0);
    }

    #[test]
    fn test_retry_after_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), Some(7_000));
        headers.insert(RETRY_AFTER, "18446744073709551615".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), Some(u64::MAX));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), None);
    }

    /// Serve one canned HTTP response on a local port, returning the base URL.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn sample_job() -> ResearchJob {
        let work = WorkUnit {
            mode: ResearchMode::ContrarianScan,
            trigger: JobTrigger::Api,
            subject: "eth".into(),
            params: serde_json::Value::Null,
            priority: 20,
            scheduled_for: None,
        };
        ResearchJob::queued("j2".into(), &work, 0.25, chrono::Utc::now())
    }

    #[tokio::test]
    async fn test_huge_retry_after_saturates() {
        let url = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\n\
             Retry-After: 18446744073709551615\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\r\n",
        )
        .await;
        let provider = HttpResearchProvider::new(&url, None, Duration::from_secs(5)).unwrap();

        let err = provider.execute(&sample_job()).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after_ms: Some(u64::MAX)
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\n\
             Content-Length: 4\r\n\
             Connection: close\r\n\r\nbusy",
        )
        .await;
        let provider = HttpResearchProvider::new(&url, None, Duration::from_secs(5)).unwrap();

        let err = provider.execute(&sample_job()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient(ref msg) if msg.contains("503")));
    }

    #[test]
    fn test_create_provider_selects_by_url() {
        let config = OrchestratorConfig::default();
        assert_eq!(create_provider(&config).name(), "dry-run");

        let config = OrchestratorConfig {
            provider_url: Some("http://127.0.0.1:9/".into()),
            ..Default::default()
        };
        assert_eq!(create_provider(&config).name(), "http");
    }
}
