//! HTTP call executor.
//!
//! Job payloads are JSON API calls:
//!
//! ```json
//! {"url": "https://svc/report", "httpMethod": "POST", "payload": {"day": 1}, "readTimeoutMs": 5000}
//! ```
//!
//! Any non-2xx status fails the execution.

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CollaboratorError;

use super::executor::JobExecutor;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An HTTP request described by a job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCall {
    pub url: String,
    #[serde(default = "default_method")]
    pub http_method: String,
    /// JSON request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ApiCall {
    pub fn decode(payload: &[u8]) -> Result<Self, CollaboratorError> {
        serde_json::from_slice(payload)
            .map_err(|e| CollaboratorError::new(format!("payload is not an API call: {e}")))
    }

    pub fn method(&self) -> Result<Method, CollaboratorError> {
        Method::from_bytes(self.http_method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CollaboratorError::new(format!("unknown HTTP method '{}'", self.http_method)))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

/// Executes [`ApiCall`] payloads with a blocking reqwest client.
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::blocking::Client,
}

impl HttpExecutor {
    pub fn new() -> Result<Self, CollaboratorError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Client with a default timeout, overridden per call by `readTimeoutMs`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollaboratorError::new(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl JobExecutor for HttpExecutor {
    fn execute(&self, payload: &[u8]) -> Result<(), CollaboratorError> {
        let call = ApiCall::decode(payload)?;
        let method = call.method()?;

        let mut request = self.client.request(method.clone(), &call.url);
        if let Some(body) = &call.payload {
            request = request.json(body);
        }
        if let Some(timeout) = call.timeout() {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .map_err(|e| CollaboratorError::new(format!("{method} {} failed: {e}", call.url)))?;

        let status = response.status();
        debug!(url = %call.url, method = %method, status = status.as_u16(), "api call finished");

        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().unwrap_or_default();
            Err(CollaboratorError::new(format!(
                "HTTP {status} from {}: {}",
                call.url,
                truncate(&body, 512)
            )))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_api_call() {
        let call = ApiCall::decode(
            br#"{"url":"http://localhost/x","httpMethod":"post","payload":{"a":1},"readTimeoutMs":250}"#,
        )
        .unwrap();

        assert_eq!(call.method().unwrap(), Method::POST);
        assert_eq!(call.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(call.payload.unwrap()["a"], 1);
    }

    #[test]
    fn method_defaults_to_get() {
        let call = ApiCall::decode(br#"{"url":"http://localhost/x"}"#).unwrap();
        assert_eq!(call.method().unwrap(), Method::GET);
        assert_eq!(call.timeout(), None);
    }

    #[test]
    fn garbage_payload_fails_without_a_request() {
        let executor = HttpExecutor::new().unwrap();
        let err = executor.execute(b"not json").unwrap_err();
        assert!(err.0.contains("not an API call"));
    }

    #[test]
    fn invalid_method_is_rejected() {
        let call = ApiCall::decode(br#"{"url":"http://x","httpMethod":"GE T"}"#).unwrap();
        assert!(call.method().is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
