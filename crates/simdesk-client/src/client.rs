use async_trait::async_trait;
use serde::Deserialize;

use simdesk_protocol::error::{ProtocolError, ProtocolResult};
use simdesk_protocol::ids::JobId;
use simdesk_protocol::job::Job;
use simdesk_protocol::source::WorkerJobsApi;

use crate::events::HttpJobEventStream;

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// HTTP client for the worker server's REST surface.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    base_url: String,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One liveness probe: `true` only on HTTP 200. Any other status or a
    /// network failure means "not ready yet", never an error.
    pub async fn alive(&self) -> bool {
        let url = format!("{}/server/alive", self.base_url);
        match self.http.get(url.as_str()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Version reported by the running server, the fallback source when the
    /// local environment probe is unavailable.
    pub async fn server_version(&self) -> ProtocolResult<String> {
        let url = format!("{}/server/version", self.base_url);
        let body = self.fetch_text(url.as_str()).await?;
        let parsed: VersionResponse = serde_json::from_str(body.as_str())
            .map_err(|error| ProtocolError::Decode(format!("server version: {error}")))?;
        Ok(parsed.version)
    }

    /// Subscription to the server's job event channel.
    pub fn job_events(&self) -> HttpJobEventStream {
        HttpJobEventStream::new(
            self.http.clone(),
            format!("{}/server/events", self.base_url),
        )
    }

    async fn fetch_text(&self, url: &str) -> ProtocolResult<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| ProtocolError::Transport(format!("GET {url} failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = sanitize_error_body(response.text().await.unwrap_or_default().as_str());
            return Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.text().await.map_err(|error| {
            ProtocolError::Transport(format!("GET {url} body read failed: {error}"))
        })
    }
}

#[async_trait]
impl WorkerJobsApi for WorkerClient {
    async fn list_jobs(&self) -> ProtocolResult<Vec<Job>> {
        let url = format!("{}/server/jobs", self.base_url);
        let body = self.fetch_text(url.as_str()).await?;
        serde_json::from_str(body.as_str())
            .map_err(|error| ProtocolError::Decode(format!("job list: {error}")))
    }

    async fn cancel_job(&self, job_id: &JobId) -> ProtocolResult<()> {
        let url = format!("{}/server/jobs/cancel/{job_id}", self.base_url);
        let response = self
            .http
            .post(url.as_str())
            .send()
            .await
            .map_err(|error| ProtocolError::Transport(format!("POST {url} failed: {error}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = sanitize_error_body(response.text().await.unwrap_or_default().as_str());
            Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn read_job_stream(&self, job_id: &JobId) -> ProtocolResult<String> {
        let url = format!("{}/server/streams/read/{job_id}", self.base_url);
        self.fetch_text(url.as_str()).await
    }
}

pub(crate) fn sanitize_error_body(body: &str) -> String {
    let mut sanitized = body
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect::<String>();
    sanitized = sanitized.split_whitespace().collect::<Vec<_>>().join(" ");
    const MAX_CHARS: usize = 240;
    if sanitized.chars().count() > MAX_CHARS {
        let clamped: String = sanitized.chars().take(MAX_CHARS).collect();
        format!("{clamped}...")
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkerClient, sanitize_error_body};

    #[test]
    fn base_url_is_normalized_without_trailing_slash() {
        let client = WorkerClient::new("http://127.0.0.1:5050/");
        assert_eq!(client.base_url(), "http://127.0.0.1:5050");
    }

    #[test]
    fn sanitize_error_body_collapses_control_characters_and_whitespace() {
        let sanitized = sanitize_error_body("  oops\x1b[31m\nsomething   broke\t");
        assert_eq!(sanitized, "oops [31m something broke");
    }

    #[test]
    fn sanitize_error_body_truncates_long_bodies() {
        let sanitized = sanitize_error_body("x".repeat(600).as_str());
        assert_eq!(sanitized.len(), 243);
        assert!(sanitized.ends_with("..."));
    }
}
