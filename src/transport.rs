//! Request dispatch.

use crate::config::RunnerConfig;
use crate::error::TransportError;
use crate::model::{canonical_reason, HttpMethod, Request, Response};
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Sends a fully substituted request and returns the decoded response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Option<String>,
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
    fail_on_error_status: bool,
}

impl HttpTransport {
    pub fn new(config: &RunnerConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &RunnerConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            timeout: config.timeout(),
            retries: config.retries,
            retry_delay: config.retry_delay(),
            fail_on_error_status: config.fail_on_error_status,
        }
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    /// Absolute urls are used as-is; anything else is joined onto the
    /// base url, if one is configured.
    fn resolve_url(&self, url: &str) -> Result<String, TransportError> {
        if url.contains("://") {
            return Ok(url.to_string());
        }
        let Some(base_url) = &self.base_url else {
            return Ok(url.to_string());
        };

        let mut base = Url::parse(base_url).map_err(|e| {
            TransportError::Setup(format!("invalid base url '{base_url}': {e}"))
        })?;
        if url.is_empty() {
            return Ok(base.to_string());
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(url.trim_start_matches('/'))
            .map(|joined| joined.to_string())
            .map_err(|e| {
                TransportError::Setup(format!(
                    "failed to join base url '{base_url}' with '{url}': {e}"
                ))
            })
    }

    async fn send_once(
        &self,
        method: ReqMethod,
        url: &str,
        request: &Request,
    ) -> Result<Response, TransportError> {
        let mut builder = self.client.request(method, url).timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                TransportError::Setup(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let status = response.status();
        debug!("Received response with status: {}", status);

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let data = decode_body(&text);

        let status_text = canonical_reason(status.as_u16()).to_string();

        if self.fail_on_error_status && !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                status_text,
                body: text,
            });
        }

        Ok(Response {
            status: status.as_u16(),
            status_text,
            headers,
            data,
        })
    }
}

/// JSON bodies are parsed; anything else is kept as a string and an
/// empty body becomes null.
fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::Network(_) => true,
        TransportError::Status { status, .. } => *status >= 500,
        TransportError::Setup(_) => false,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let url = self.resolve_url(&request.url)?;
        let method = Self::convert_method(request.method);

        let mut attempt = 0u32;
        loop {
            debug!("Sending request to {}", url);
            match self.send_once(method.clone(), &url, request).await {
                Ok(response) if response.status >= 500 && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.retry_delay * attempt;
                    warn!(
                        status = response.status,
                        attempt,
                        "server error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.retries && is_retryable(&err) => {
                    attempt += 1;
                    let delay = self.retry_delay * attempt;
                    warn!(
                        error = %err,
                        attempt,
                        "request failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport(base_url: Option<&str>) -> HttpTransport {
        let mut config = RunnerConfig::default();
        config.base_url = base_url.map(str::to_string);
        HttpTransport::new(&config)
    }

    #[test]
    fn test_resolve_url_joins_base() {
        let t = transport(Some("http://localhost:8080/api"));
        assert_eq!(t.resolve_url("/items/1").unwrap(), "http://localhost:8080/api/items/1");
        assert_eq!(t.resolve_url("items").unwrap(), "http://localhost:8080/api/items");
        assert_eq!(t.resolve_url("").unwrap(), "http://localhost:8080/api");
        assert_eq!(
            t.resolve_url("https://other.test/x").unwrap(),
            "https://other.test/x"
        );
    }

    #[test]
    fn test_resolve_url_without_base() {
        let t = transport(None);
        assert_eq!(t.resolve_url("/items").unwrap(), "/items");
    }

    #[test]
    fn test_invalid_base_url_is_setup_error() {
        let t = transport(Some("not a url"));
        assert!(matches!(t.resolve_url("/x"), Err(TransportError::Setup(_))));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(r#"{"a": 1}"#), json!({"a": 1}));
        assert_eq!(decode_body("plain text"), json!("plain text"));
        assert_eq!(decode_body("  "), Value::Null);
    }

    #[test]
    fn test_retryable_errors() {
        let status = |status| TransportError::Status {
            status,
            status_text: String::new(),
            body: String::new(),
        };
        assert!(is_retryable(&TransportError::Network("reset".into())));
        assert!(is_retryable(&status(503)));
        assert!(!is_retryable(&status(404)));
        assert!(!is_retryable(&TransportError::Setup("bad".into())));
    }
}
