use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use common::RetryPolicy;
use log::{debug, warn};
use reqwest::{header::AUTHORIZATION, multipart, Client};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;

use crate::error::UploadError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content: Bytes,
    },
}

impl FormPart {
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self::Text {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Form(Vec<FormPart>),
}

/// A transport-independent description of one HTTP call. Cheap to clone, so
/// the same request can be replayed on every retry.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub authorization: Option<String>,
    pub body: Body,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            authorization: None,
            body: Body::Empty,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(url)
        }
    }

    /// An empty token leaves the request anonymous.
    pub fn authorization(mut self, token: &str) -> Self {
        self.authorization = (!token.is_empty()).then(|| token.to_string());
        self
    }

    pub fn json<T: Serialize>(mut self, payload: &T) -> Result<Self, UploadError> {
        self.body = Body::Json(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn form(mut self, parts: Vec<FormPart>) -> Self {
        self.body = Body::Form(parts);
        self
    }
}

#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    /// Client and server errors are both worth another attempt, except 401
    /// which [`RetryingTransport`] handles separately.
    pub fn is_retryable(&self) -> bool {
        (400..600).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UploadError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn snippet(&self) -> String {
        let end = self.body.len().min(200);
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }
}

/// One network round trip. Implementations do not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, timeout: Duration)
        -> Result<ApiResponse, UploadError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, UploadError> {
        let client = Client::builder()
            .user_agent(concat!("geoupload/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()?;
        Ok(Self { client })
    }

    fn build_form(parts: &[FormPart]) -> multipart::Form {
        parts
            .iter()
            .fold(multipart::Form::new(), |form, part| match part {
                FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
                FormPart::File {
                    name,
                    file_name,
                    content,
                } => form.part(
                    name.clone(),
                    multipart::Part::stream_with_length(content.clone(), content.len() as u64)
                        .file_name(file_name.clone()),
                ),
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        timeout: Duration,
    ) -> Result<ApiResponse, UploadError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(timeout);
        if let Some(token) = &request.authorization {
            builder = builder.header(AUTHORIZATION, token);
        }
        builder = match &request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Form(parts) => builder.multipart(Self::build_form(parts)),
        };
        let res = builder.send().await?;
        let status = res.status().as_u16();
        let body = res.bytes().await?;
        Ok(ApiResponse { status, body })
    }
}

/// Wraps a [`Transport`] with bounded retries and backoff.
#[derive(Clone)]
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Sends `request` up to `max_retry + 1` times. Statuses in `[400, 600)` and
    /// connection errors are retried; a 401 fails immediately.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, UploadError> {
        let attempts = self.policy.attempts();
        let mut last_status = None;
        let mut message = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.delay_before(attempt);
                debug!(
                    "retrying {} in {:?} (attempt {}/{})",
                    request.url,
                    delay,
                    attempt + 1,
                    attempts
                );
                sleep(delay).await;
            }
            match self.inner.send(request, self.policy.timeout).await {
                Ok(res) if res.status == 401 => {
                    return Err(UploadError::AuthenticationFailed {
                        url: request.url.clone(),
                    });
                }
                Ok(res) if res.is_retryable() => {
                    warn!("try {attempt} of {} got status {}", request.url, res.status);
                    last_status = Some(res.status);
                    message = res.snippet();
                }
                Ok(res) => return Ok(res),
                Err(e) => {
                    warn!("try {attempt} of {} failed: {e}", request.url);
                    last_status = None;
                    message = e.to_string();
                }
            }
        }
        Err(UploadError::TransportExhausted {
            url: request.url.clone(),
            attempts,
            last_status,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{respond, MockTransport};
    use common::Backoff;
    use tokio::time::Instant;

    fn policy(max_retry: u32) -> RetryPolicy {
        RetryPolicy::new(max_retry, Duration::ZERO, Duration::from_secs(5))
            .with_backoff(Backoff::Fixed)
    }

    #[test]
    fn http_transport_creation() {
        assert!(HttpTransport::new().is_ok());
    }

    /// Serves one request on a local socket and returns its raw text.
    async fn capture_one_request(listener: tokio::net::TcpListener) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end].lines().find_map(|line| {
                    let line = line.to_ascii_lowercase();
                    line.strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap())
                });
                match length {
                    Some(len) if raw.len() < end + 4 + len => {}
                    _ => break,
                }
            }
            if n == 0 {
                break;
            }
        }
        socket
            .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8_lossy(&raw).to_string()
    }

    #[tokio::test]
    async fn multipart_file_part_is_sent_with_known_length() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(capture_one_request(listener));

        let content = Bytes::from_static(b"pixel-data");
        let request = ApiRequest::post(format!("http://{addr}/")).form(vec![
            FormPart::text("key", "images/1/a.jpg"),
            FormPart::File {
                name: "file".to_string(),
                file_name: "a.jpg".to_string(),
                content,
            },
        ]);
        let transport = HttpTransport::new().unwrap();
        let res = transport.send(&request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(res.status, 204);

        let raw = server.await.unwrap();
        assert!(raw.to_ascii_lowercase().contains("content-length:"), "{raw}");
        assert!(!raw.to_ascii_lowercase().contains("transfer-encoding: chunked"));
        assert!(raw.contains(r#"filename="a.jpg""#));
        assert!(raw.contains("pixel-data"));
    }

    #[tokio::test]
    async fn error_statuses_use_every_attempt() {
        for (k, status) in [(0, 500), (1, 404), (3, 503), (5, 400)] {
            let mock = MockTransport::new(move |_| respond(status, "nope"));
            let transport = RetryingTransport::new(mock.clone(), policy(k));
            let err = transport
                .execute(&ApiRequest::get("https://api.test/x"))
                .await
                .unwrap_err();
            assert_eq!(mock.call_count(), k as usize + 1);
            match err {
                UploadError::TransportExhausted {
                    attempts,
                    last_status,
                    message,
                    ..
                } => {
                    assert_eq!(attempts, k + 1);
                    assert_eq!(last_status, Some(status));
                    assert_eq!(message, "nope");
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let mock = MockTransport::new(|_| respond(401, "bad token"));
        let transport = RetryingTransport::new(mock.clone(), policy(5));
        let err = transport
            .execute(&ApiRequest::post("https://api.test/api/dataset/"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AuthenticationFailed { .. }));
        assert_eq!(err.status(), Some(401));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let mock = MockTransport::new(|_| respond(200, "{}"));
        mock.fail_first(2, |_| Err(UploadError::Connection("reset".to_string())));
        let transport = RetryingTransport::new(mock.clone(), policy(2));
        let res = transport
            .execute(&ApiRequest::get("https://api.test/x"))
            .await
            .unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn connection_errors_exhaust_without_status() {
        let mock = MockTransport::new(|_| Err(UploadError::Connection("refused".to_string())));
        let transport = RetryingTransport::new(mock.clone(), policy(1));
        let err = transport
            .execute(&ApiRequest::get("https://api.test/x"))
            .await
            .unwrap_err();
        assert_eq!(mock.call_count(), 2);
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts_only() {
        let mock = MockTransport::new(|_| respond(502, ""));
        let retry = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(5));
        let transport = RetryingTransport::new(mock.clone(), retry);
        let start = Instant::now();
        transport
            .execute(&ApiRequest::get("https://api.test/x"))
            .await
            .unwrap_err();
        // 2s + 4s + 8s of exponential backoff, nothing after the final attempt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(14), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "{elapsed:?}");
        assert_eq!(mock.call_count(), 4);
    }
}
