//! Request/response backend for typed text and document submissions.

use std::time::Duration;

use async_trait::async_trait;
use duet_core::APP_NAME;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const TEXT_ENDPOINT: &str = "/process-text";
const FILE_ENDPOINT: &str = "/process-file";

/// Reply used when the server accepts a request but sends no summary.
pub const FALLBACK_SUMMARY: &str = "I processed your request.";

#[derive(Debug, Error)]
pub enum RequestError {
    /// Non-2xx response carrying a `detail` for the user
    #[error("server rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("server returned status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    /// The server-provided explanation, if there is one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            RequestError::Rejected { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

/// Something that answers typed requests with a short summary.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn process_text(&self, text: &str) -> Result<String, RequestError>;

    /// Submit a document under its original file name.
    async fn process_file(&self, name: &str, contents: Vec<u8>) -> Result<String, RequestError>;

    /// Returns the name of this backend for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    detail: serde_json::Value,
}

/// [`Backend`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn process_text(&self, text: &str) -> Result<String, RequestError> {
        debug!(chars = text.len(), "Sending text request");
        let response = self
            .client
            .post(self.url(TEXT_ENDPOINT))
            .json(&TextRequest { text })
            .send()
            .await?;
        read_summary(response).await
    }

    async fn process_file(&self, name: &str, contents: Vec<u8>) -> Result<String, RequestError> {
        debug!(file = name, bytes = contents.len(), "Sending file request");
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(contents).file_name(name.to_string()),
        );
        let response = self
            .client
            .post(self.url(FILE_ENDPOINT))
            .multipart(form)
            .send()
            .await?;
        read_summary(response).await
    }

    fn name(&self) -> &str {
        "http"
    }
}

async fn read_summary(response: reqwest::Response) -> Result<String, RequestError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(rejection(status.as_u16(), &body));
    }

    let parsed: SummaryResponse =
        serde_json::from_str(&body).map_err(|e| RequestError::InvalidResponse(e.to_string()))?;
    Ok(parsed
        .summary
        .filter(|summary| !summary.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_SUMMARY.to_string()))
}

/// Map an error body to a [`RequestError`]. FastAPI puts a string in
/// `detail` for handled errors and a list of problems for validation errors.
fn rejection(status: u16, body: &str) -> RequestError {
    let detail = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| match e.detail {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
    match detail {
        Some(detail) => RequestError::Rejected { status, detail },
        None => RequestError::Status(status),
    }
}
