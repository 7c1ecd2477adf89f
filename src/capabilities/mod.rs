//! Standard capabilities shipped with the sandbox.
//!
//! Hosts are free to bind anything; this module only bundles the
//! "connector" preset: an HTTP client (a `get`/`post` object on the JS
//! side) and a JavaScript backend exposing the usual payload fields as
//! variables.

pub mod http;

use crate::backend::JsBackend;
use crate::config::Config;
use crate::sandbox::Bindings;

pub use http::HttpClient;

/// Name under which the HTTP client is bound.
pub const HTTP_BINDING: &str = "http";

/// Standard bindings of the connector preset.
pub fn connector_bindings(config: &Config) -> Bindings {
    Bindings::new().host(HTTP_BINDING, HttpClient::new(&config.http))
}

/// JavaScript backend configured for connector scripts.
pub fn connector_js_backend(config: &Config) -> JsBackend {
    JsBackend::new(config.js.clone()).with_payload_aliases(config.connector.payload_aliases.clone())
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves a single canned HTTP response on a local port.
    pub(crate) async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/resource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use super::test_support::serve_once;
    use crate::backend::NativeBackend;
    use crate::error::ScriptError;
    use crate::sandbox::{
        CancelSignal, ContextBuilder, ErrorKind, ExecutionContext, LogSink, Sandbox,
    };
    use crate::config::SandboxOptions;

    /// Fetches `payload.url` through the bound HTTP client.
    fn fetcher() -> NativeBackend {
        NativeBackend::new().register("fetch", |ctx: ExecutionContext| async move {
            let url = ctx.payload()["url"].as_str().unwrap_or_default().to_string();
            let http = ctx
                .host::<HttpClient>(HTTP_BINDING)
                .ok_or_else(|| ScriptError::new("http capability missing"))?;
            http.get_json(&url).await
        })
    }

    fn js_sandbox(source: &str) -> Sandbox {
        let config = Config::default();
        Sandbox::new(
            source,
            connector_bindings(&config),
            SandboxOptions::default(),
            Arc::new(connector_js_backend(&config)),
        )
        .unwrap()
    }

    fn fetch_sandbox() -> Sandbox {
        Sandbox::new(
            "fetch",
            connector_bindings(&Config::default()),
            SandboxOptions::default(),
            Arc::new(fetcher()),
        )
        .unwrap()
    }

    #[test]
    fn test_connector_bindings_expose_http() {
        let frozen = connector_bindings(&Config::default()).freeze().unwrap();
        let ctx = ContextBuilder::new(frozen)
            .build(json!({}), LogSink::new(), CancelSignal::new())
            .unwrap();
        assert!(ctx.host::<HttpClient>(HTTP_BINDING).is_some());
    }

    #[test]
    fn test_connector_backend_aliases() {
        let backend = connector_js_backend(&Config::default());
        assert!(backend.payload_aliases().iter().any(|a| a == "user"));
        assert!(backend.payload_aliases().iter().any(|a| a == "account"));
    }

    #[tokio::test]
    async fn test_outbound_call_success() {
        let url = serve_once("200 OK", r#"{"plan":"pro"}"#).await;
        let outcome = fetch_sandbox().run_one(json!({ "url": url })).await;
        assert_eq!(outcome.result(), Some(&json!({"plan": "pro"})));
    }

    #[tokio::test]
    async fn test_outbound_service_error_is_script_error() {
        let url = serve_once("503 Service Unavailable", "").await;
        let outcome = fetch_sandbox().run_one(json!({ "url": url })).await;

        assert!(outcome.result().is_none());
        let err = outcome.error().unwrap();
        assert_eq!(err.kind, ErrorKind::Script);
        assert_eq!(err.name.as_deref(), Some("HttpError"));
        assert!(err.message.contains("HTTP 503"), "{}", err.message);
    }

    // ── From JavaScript ─────────────────────────────────

    #[tokio::test]
    async fn test_js_sees_http_binding() {
        let outcome = js_sandbox("return typeof http;").run_one(json!({})).await;
        assert_eq!(outcome.result(), Some(&json!("object")));
    }

    #[tokio::test]
    async fn test_js_outbound_call_success() {
        let url = serve_once("200 OK", r#"{"plan":"pro"}"#).await;
        let outcome = js_sandbox("return http.get(payload.url).then(function (body) { return body.plan; });")
            .run_one(json!({ "url": url }))
            .await;
        assert!(outcome.error().is_none(), "{:?}", outcome.error());
        assert_eq!(outcome.result(), Some(&json!("pro")));
    }

    #[tokio::test]
    async fn test_js_outbound_post_echoes_answer() {
        let url = serve_once("200 OK", r#"{"created":true}"#).await;
        let outcome = js_sandbox("return http.post(payload.url, { name: 'x' });")
            .run_one(json!({ "url": url }))
            .await;
        assert_eq!(outcome.result(), Some(&json!({"created": true})));
    }

    #[tokio::test]
    async fn test_js_outbound_service_error_is_script_error() {
        let url = serve_once("503 Service Unavailable", "").await;
        let outcome = js_sandbox("return http.get(payload.url);")
            .run_one(json!({ "url": url }))
            .await;

        assert!(outcome.result().is_none());
        let err = outcome.error().unwrap();
        assert_eq!(err.kind, ErrorKind::Script);
        assert_eq!(err.name.as_deref(), Some("HttpError"));
        assert!(err.message.contains("HTTP 503"), "{}", err.message);
    }
}
