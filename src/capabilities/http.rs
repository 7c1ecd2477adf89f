//! Host capability: outbound HTTP for native routines and JS scripts.
//!
//! Requests are plain futures, so a run that gets cancelled drops the
//! in-flight request with it. Anything but a 2xx answer is reported as a
//! script error naming the status, which is what script authors need to
//! see when a remote service misbehaves.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::ScriptError;

/// Maximum response body accepted (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

const ERROR_NAME: &str = "HttpError";

/// HTTP client handed to scripts as a host capability.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Self {
        let client = Self::builder(config)
            .user_agent(config.user_agent.as_str())
            .build()
            .or_else(|e| {
                warn!(
                    "Cannot build HTTP client with user agent {:?}: {e}, using the default agent",
                    config.user_agent
                );
                Self::builder(config).build()
            })
            .unwrap_or_else(|e| {
                warn!("Cannot build HTTP client: {e}, timeouts and redirect policy are not applied");
                Client::new()
            });

        Self { client }
    }

    fn builder(config: &HttpConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(5))
    }

    /// `GET url`, decoding the body as JSON.
    pub async fn get_json(&self, url: &str) -> Result<Value, ScriptError> {
        let url = validate_url(url)?;
        self.send("GET", &url, self.client.get(url.clone())).await
    }

    /// `POST url` with a JSON body, decoding the answer as JSON.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value, ScriptError> {
        let url = validate_url(url)?;
        self.send("POST", &url, self.client.post(url.clone()).json(body))
            .await
    }

    async fn send(
        &self,
        method: &str,
        url: &url::Url,
        request: RequestBuilder,
    ) -> Result<Value, ScriptError> {
        debug!("{method} {url}");

        let response = request.send().await.map_err(|e| {
            warn!("{method} {url} failed: {e}");
            http_error(format!("{method} {url} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(format!("{method} {url} failed: HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_SIZE {
                return Err(http_error(format!(
                    "{method} {url} failed: response too large ({len} bytes, limit is {MAX_RESPONSE_SIZE} bytes)"
                )));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| http_error(format!("{method} {url} failed reading body: {e}")))?;

        if body.len() > MAX_RESPONSE_SIZE {
            return Err(http_error(format!(
                "{method} {url} failed: response too large ({} bytes, limit is {MAX_RESPONSE_SIZE} bytes)",
                body.len()
            )));
        }

        decode_body(&body)
            .map_err(|e| http_error(format!("{method} {url} returned invalid JSON: {e}")))
    }
}

fn http_error(message: String) -> ScriptError {
    ScriptError::named(ERROR_NAME, message)
}

fn validate_url(url: &str) -> Result<url::Url, ScriptError> {
    let parsed =
        url::Url::parse(url).map_err(|e| http_error(format!("invalid URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(http_error(format!(
            "unsupported scheme '{scheme}' (only http/https)"
        ))),
    }
}

/// Empty bodies decode to `null`.
fn decode_body(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::capabilities::test_support::serve_once;

    fn client() -> HttpClient {
        HttpClient::new(&HttpConfig::default())
    }

    #[test]
    fn test_validate_url_rejects_garbage() {
        let err = validate_url("not-a-url").unwrap_err();
        assert_eq!(err.name.as_deref(), Some("HttpError"));
        assert!(err.message.contains("invalid URL"));
    }

    #[test]
    fn test_validate_url_rejects_scheme() {
        let err = validate_url("ftp://example.com/file").unwrap_err();
        assert!(err.message.contains("unsupported scheme 'ftp'"));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b"").unwrap(), Value::Null);
        assert_eq!(decode_body(b"  \n").unwrap(), Value::Null);
        assert_eq!(decode_body(br#"{"ok":true}"#).unwrap(), json!({"ok": true}));
        assert!(decode_body(b"<html>").is_err());
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let url = serve_once("200 OK", r#"{"id":7}"#).await;
        assert_eq!(client().get_json(&url).await.unwrap(), json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_invalid_user_agent_keeps_client_usable() {
        let config = HttpConfig {
            user_agent: "bad\nagent".to_string(),
            ..HttpConfig::default()
        };
        let url = serve_once("200 OK", r#"{"id":8}"#).await;
        assert_eq!(HttpClient::new(&config).get_json(&url).await.unwrap(), json!({"id": 8}));
    }

    #[tokio::test]
    async fn test_service_error_names_status() {
        let url = serve_once("503 Service Unavailable", "").await;
        let err = client().get_json(&url).await.unwrap_err();
        assert_eq!(err.name.as_deref(), Some("HttpError"));
        assert!(err.message.contains("503"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_post_json_success() {
        let url = serve_once("201 Created", r#"{"created":true}"#).await;
        let value = client().post_json(&url, &json!({"a": 1})).await.unwrap();
        assert_eq!(value, json!({"created": true}));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let url = serve_once("200 OK", "not json").await;
        let err = client().get_json(&url).await.unwrap_err();
        assert!(err.message.contains("invalid JSON"));
    }
}
