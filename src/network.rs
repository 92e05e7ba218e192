use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use std::time::Duration;
use tokio::time::timeout;

use crate::config::{Limits, SessionCredentials};

/// Raw outcome of one HTTP GET, whatever the status.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// URL after redirects.
    pub final_url: String,
    pub retry_after: Option<Duration>,
}

/// Errors below the HTTP status level.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("DNS resolution failed")]
    Dns,

    #[error("SSL/TLS error - certificate or encryption issue")]
    Tls,

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Transient errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::ConnectionReset => true,
            TransportError::Network(msg) | TransportError::Body(msg) => {
                let msg_lower = msg.to_lowercase();
                msg_lower.contains("timeout")
                    || msg_lower.contains("timed out")
                    || msg_lower.contains("broken pipe")
                    || msg_lower.contains("connection reset")
                    || msg_lower.contains("connection closed")
                    || msg_lower.contains("temporary")
            }
            TransportError::ConnectionRefused
            | TransportError::Dns
            | TransportError::Tls
            | TransportError::ContentTooLarge(_, _)
            | TransportError::InvalidRequest(_) => false,
        }
    }
}

/// A single-attempt GET. Retry, pacing and cancellation live in the fetcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, max_bytes: usize) -> Result<RawResponse, TransportError>;
}

/// reqwest-backed transport carrying the session credentials on every request.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout_duration: Duration,
}

impl HttpClient {
    pub fn new(
        user_agent: &str,
        timeout_duration: Duration,
        session: &SessionCredentials,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(Self::session_headers(session)?)
            .timeout(timeout_duration)
            .connect_timeout(Duration::from_secs(Limits::CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(Limits::POOL_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(Limits::POOL_IDLE_TIMEOUT_SECS))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(Limits::MAX_REDIRECTS))
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            timeout_duration,
        })
    }

    fn session_headers(session: &SessionCredentials) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/*;q=0.8,*/*;q=0.5",
            ),
        );
        headers.insert("Accept-Language", HeaderValue::from_static("en-US,en;q=0.5"));

        if let Some(cookie) = &session.cookie {
            let value = HeaderValue::from_str(cookie.trim())
                .map_err(|e| TransportError::InvalidRequest(format!("cookie: {}", e)))?;
            headers.insert(COOKIE, value);
        }
        for (name, value) in &session.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value.trim()).map_err(|e| {
                TransportError::InvalidRequest(format!("header {}: {}", name.as_str(), e))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Classify reqwest errors into transport error kinds
    fn classify_error(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            return TransportError::Timeout;
        }
        if error.is_builder() {
            return TransportError::InvalidRequest(error.to_string());
        }

        let error_msg = format!("{:?}", error).to_lowercase();
        if error_msg.contains("connection refused") {
            return TransportError::ConnectionRefused;
        }
        if error_msg.contains("connection reset") {
            return TransportError::ConnectionReset;
        }
        if error_msg.contains("dns") || error_msg.contains("name resolution") {
            return TransportError::Dns;
        }
        if error_msg.contains("certificate") || error_msg.contains("tls") {
            return TransportError::Tls;
        }

        TransportError::Network(error.to_string())
    }

    fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn get(&self, url: &str, max_bytes: usize) -> Result<RawResponse, TransportError> {
        let response = timeout(self.timeout_duration, self.client.get(url).send())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(Self::classify_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let retry_after = Self::parse_retry_after(response.headers());

        if let Some(length) = response.content_length()
            && length as usize > max_bytes
        {
            return Err(TransportError::ContentTooLarge(length as usize, max_bytes));
        }

        // Enforce the size limit while streaming
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = timeout(self.timeout_duration, stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?;
            match chunk {
                Some(Ok(bytes)) => {
                    if body.len() + bytes.len() > max_bytes {
                        return Err(TransportError::ContentTooLarge(
                            body.len() + bytes.len(),
                            max_bytes,
                        ));
                    }
                    body.extend_from_slice(&bytes);
                }
                Some(Err(e)) => return Err(TransportError::Body(e.to_string())),
                None => break,
            }
        }

        Ok(RawResponse {
            status,
            content_type,
            body,
            final_url,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let client = HttpClient::new(
            "TestBot/1.0",
            Duration::from_secs(5),
            &SessionCredentials::default(),
        )
        .unwrap();

        let result = client.get("not-a-url", 1024).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_session_headers() {
        let mut session = SessionCredentials {
            cookie: Some("xf_session=abc".to_string()),
            ..SessionCredentials::default()
        };
        session
            .headers
            .insert("X-Requested-With".to_string(), "archive".to_string());

        let headers = HttpClient::session_headers(&session).unwrap();
        assert_eq!(headers.get(COOKIE).unwrap(), "xf_session=abc");
        assert_eq!(headers.get("x-requested-with").unwrap(), "archive");
    }

    #[test]
    fn test_session_headers_reject_bad_names() {
        let mut session = SessionCredentials::default();
        session
            .headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            HttpClient::session_headers(&session),
            Err(TransportError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            HttpClient::parse_retry_after(&headers),
            Some(Duration::from_secs(7))
        );
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(HttpClient::parse_retry_after(&headers), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::ConnectionReset.is_transient());
        assert!(TransportError::Network("operation timed out".into()).is_transient());
        assert!(!TransportError::Dns.is_transient());
        assert!(!TransportError::ContentTooLarge(10, 5).is_transient());
    }
}
