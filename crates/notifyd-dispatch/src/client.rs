//! Outbound HTTP client with bounded connections and strict timeouts.
//!
//! Thin wrapper over a pooled reqwest client. Every request runs under a
//! hard total deadline; transport failures are categorized for the retry
//! machinery. Log lines carry redacted headers and truncated bodies only.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use notifyd_core::HttpMethod;
use tracing::{debug, warn};

use crate::{
    error::{DispatchError, Result},
    headers::{redact, truncate_for_log, LOG_BODY_LIMIT},
};

/// Configuration for the outbound client.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClientConfig {
    /// TCP connect deadline.
    pub connect_timeout: Duration,

    /// Total per-request deadline, TLS and body included.
    pub request_timeout: Duration,

    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,

    /// How long an idle connection may linger in the pool.
    pub pool_idle_timeout: Duration,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: "notifyd/0.1".to_string(),
        }
    }
}

/// Response from one outbound call.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    /// HTTP status code.
    pub status_code: u16,

    /// Full response body.
    pub body: Bytes,

    /// Wall time of the call, connect to last body byte.
    pub latency: Duration,
}

/// Pooled HTTP caller for webhook delivery.
#[derive(Debug, Clone)]
pub struct OutboundClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl OutboundClient {
    /// Builds a client with the given limits.
    ///
    /// Redirects are disabled: a 3xx response already classifies as success,
    /// so following it would deliver twice.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` when the underlying client
    /// cannot be constructed.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DispatchError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Builds a client with default limits.
    ///
    /// # Errors
    ///
    /// Returns error when the underlying client cannot be constructed.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Issues one HTTP call and returns the categorized result.
    ///
    /// `Content-Type: application/json` is assumed when a body is present
    /// and the caller set none. Headers must already be rendered — this
    /// layer sends values verbatim.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Timeout` when the total deadline elapses.
    /// - `DispatchError::Network` for DNS, connect, TLS, and mid-stream
    ///   failures.
    pub async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &HashMap<String, String>,
        body: Bytes,
    ) -> Result<OutboundResponse> {
        let start = std::time::Instant::now();

        let reqwest_method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let has_body = !body.is_empty();
        let mut request = self.client.request(reqwest_method, url);

        let mut content_type_set = false;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("content-type") {
                content_type_set = true;
            }
            request = request.header(name, value);
        }

        if has_body && !content_type_set {
            request = request.header("content-type", "application/json");
        }

        if has_body {
            request = request.body(body.clone());
        }

        debug!(
            method = %method,
            url,
            headers = ?redact(headers),
            body = %truncate_for_log(&String::from_utf8_lossy(&body), LOG_BODY_LIMIT),
            "sending outbound request"
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let latency = start.elapsed();
                warn!(url, latency_ms = latency.as_millis() as u64, error = %e, "request failed");

                if e.is_timeout() {
                    return Err(DispatchError::timeout(self.config.request_timeout.as_secs()));
                }
                if e.is_connect() {
                    return Err(DispatchError::network(format!("connection failed: {e}")));
                }
                return Err(DispatchError::network(e.to_string()));
            },
        };

        let status_code = response.status().as_u16();

        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.is_timeout() {
                    return Err(DispatchError::timeout(self.config.request_timeout.as_secs()));
                }
                return Err(DispatchError::network(format!("failed to read response body: {e}")));
            },
        };

        let latency = start.elapsed();

        debug!(
            url,
            status = status_code,
            latency_ms = latency.as_millis() as u64,
            body = %truncate_for_log(&String::from_utf8_lossy(&body), LOG_BODY_LIMIT),
            "received response"
        );

        Ok(OutboundResponse { status_code, body, latency })
    }
}
