//! Bearer-token validation against the account endpoint.
//!
//! [`AuthValidator`] POSTs the token as a urlencoded form and parses the
//! account record (user identity, subscription, per-resource limits).
//! A response counts as valid iff `status == "success"` and `code == 200`.
//! The validator is stateless; callers may invoke it as often as they like.

use std::time::Duration;

use serde::Deserialize;

/// Sent on every validation request. Some deployments block unknown agents.
pub const USER_AGENT: &str = "HaxorportClient/1.0";

// ── Response model ───────────────────────────────────────────────────

/// Envelope returned by the validation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: AuthData,
    #[serde(default)]
    pub meta: AuthMeta,
}

impl AuthResponse {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == "success" && self.code == 200
    }
}

/// Account record inside a successful validation response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthData {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub subscription: Subscription,
}

impl AuthData {
    /// Tunnel quota check: `(reached, used, limit)`. The quota is exhausted
    /// when the server says so or when usage meets the limit.
    #[must_use]
    pub fn tunnel_limit_reached(&self) -> (bool, i64, i64) {
        let limits = &self.subscription.limits.tunnels;
        let reached = limits.reached || limits.used >= limits.limit;
        (reached, limits.used, limits.limit)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AuthMeta {
    #[serde(default)]
    pub header_status_code: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limits: SubscriptionLimits,
    #[serde(default)]
    pub features: SubscriptionFeatures,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SubscriptionLimits {
    #[serde(default)]
    pub tunnels: ResourceLimit,
    #[serde(default)]
    pub ports: ResourceLimit,
    #[serde(default)]
    pub bandwidth: ResourceLimit,
    #[serde(default)]
    pub requests: ResourceLimit,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResourceLimit {
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub reached: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SubscriptionFeatures {
    #[serde(default, rename = "customDomains")]
    pub custom_domains: bool,
    #[serde(default)]
    pub analytics: bool,
    #[serde(default, rename = "prioritySupport")]
    pub priority_support: bool,
}

// ── Validator ────────────────────────────────────────────────────────

/// Validates tokens against one endpoint.
pub struct AuthValidator {
    http: reqwest::Client,
    validation_url: String,
}

impl AuthValidator {
    pub fn new(validation_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            validation_url: validation_url.into(),
        }
    }

    /// Validate `token`, returning the populated account record on success.
    pub async fn validate(&self, token: &str) -> Result<AuthResponse, AuthError> {
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        let response = self
            .http
            .post(&self.validation_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(AuthError::Network)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AuthError::NonOkStatus(status.as_u16()));
        }

        let body = response.text().await.map_err(AuthError::Network)?;
        let parsed: AuthResponse = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(100).collect();
            AuthError::MalformedJson(format!("{e} (body starts: {preview:?})"))
        })?;

        if !parsed.is_valid() {
            return Err(AuthError::Unauthorized(parsed.message));
        }
        Ok(parsed)
    }
}

/// Derive the validation URL when the configured one is empty.
#[must_use]
pub fn default_validation_url(server_address: &str, tls_enabled: bool) -> String {
    let scheme = if tls_enabled { "https" } else { "http" };
    format!("{scheme}://{server_address}/AuthToken/validate")
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AuthError {
    /// No token configured; no request was made.
    EmptyToken,
    /// The validation endpoint could not be reached.
    Network(reqwest::Error),
    /// The endpoint answered with a non-200 status.
    NonOkStatus(u16),
    /// The endpoint answered 200 but the body was not the expected JSON.
    MalformedJson(String),
    /// The token was rejected (`status`/`code` did not indicate success).
    Unauthorized(String),
}

impl AuthError {
    /// Admission failures must not be retried with the same token.
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(self, AuthError::EmptyToken | AuthError::Unauthorized(_))
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::EmptyToken => write!(f, "authentication token is empty"),
            AuthError::Network(e) => write!(f, "token validation request failed: {e}"),
            AuthError::NonOkStatus(code) => {
                write!(f, "token validation failed with status code {code}")
            }
            AuthError::MalformedJson(e) => write!(f, "token validation response is not valid JSON: {e}"),
            AuthError::Unauthorized(msg) => {
                if msg.is_empty() {
                    write!(f, "invalid token")
                } else {
                    write!(f, "invalid token: {msg}")
                }
            }
        }
    }
}

impl std::error::Error for AuthError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP stub: accepts a single connection, captures the
    /// request, answers with the canned response.
    async fn stub_endpoint(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = vec![0u8; 4096];
            // Read until the headers and the Content-Length-announced body
            // are both in hand; the form body may arrive in its own segment.
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let body_len = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + body_len {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}/AuthToken/validate"), handle)
    }

    const VALID_BODY: &str = r#"{
        "code": 200, "status": "success", "message": "ok",
        "data": {
            "user_id": "u1", "fullname": "Demo User", "username": "demo",
            "email": "demo@example.net",
            "subscription": {
                "name": "pro",
                "limits": {
                    "tunnels": {"limit": 5, "used": 2, "reached": false},
                    "ports": {"limit": 5, "used": 0, "reached": false},
                    "bandwidth": {"limit": 100, "used": 1, "reached": false},
                    "requests": {"limit": 1000, "used": 10, "reached": false}
                },
                "features": {"customDomains": true, "analytics": false, "prioritySupport": true}
            }
        },
        "meta": {"header_status_code": 200}
    }"#;

    fn http_ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn valid_token_parses_subscription() {
        let response = Box::leak(http_ok(VALID_BODY).into_boxed_str());
        let (url, request) = stub_endpoint(response).await;
        let validator = AuthValidator::new(url);
        let parsed = validator.validate("hxp_demo_token").await.unwrap();

        assert_eq!(parsed.data.email, "demo@example.net");
        assert_eq!(parsed.data.subscription.limits.tunnels.limit, 5);
        assert!(parsed.data.subscription.features.custom_domains);
        let (reached, used, limit) = parsed.data.tunnel_limit_reached();
        assert!(!reached);
        assert_eq!((used, limit), (2, 5));

        // Contract: urlencoded form POST with the fixed user agent.
        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /AuthToken/validate"));
        assert!(raw.contains("content-type: application/x-www-form-urlencoded"));
        assert!(raw.contains("user-agent: HaxorportClient/1.0"));
        assert!(raw.ends_with("token=hxp_demo_token"));
    }

    #[tokio::test]
    async fn empty_token_fails_without_network() {
        // Unroutable URL: if a request were made, this would hang or error
        // differently. EmptyToken must short-circuit first.
        let validator = AuthValidator::new("http://127.0.0.1:1/AuthToken/validate");
        assert!(matches!(
            validator.validate("").await,
            Err(AuthError::EmptyToken)
        ));
    }

    #[tokio::test]
    async fn rejected_token_is_unauthorized() {
        let body = r#"{"code": 401, "status": "error", "message": "token expired"}"#;
        let response = Box::leak(http_ok(body).into_boxed_str());
        let (url, _request) = stub_endpoint(response).await;
        let validator = AuthValidator::new(url);
        match validator.validate("hxp_expired").await {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected Unauthorized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_ok_status_is_classified() {
        let (url, _request) =
            stub_endpoint("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        let validator = AuthValidator::new(url);
        assert!(matches!(
            validator.validate("hxp_any").await,
            Err(AuthError::NonOkStatus(503))
        ));
    }

    #[tokio::test]
    async fn html_body_is_malformed_json() {
        let response = Box::leak(http_ok("<html>maintenance</html>").into_boxed_str());
        let (url, _request) = stub_endpoint(response).await;
        let validator = AuthValidator::new(url);
        assert!(matches!(
            validator.validate("hxp_any").await,
            Err(AuthError::MalformedJson(_))
        ));
    }

    #[test]
    fn quota_reached_flag_and_count_both_trip() {
        let mut data = AuthData::default();
        data.subscription.limits.tunnels = ResourceLimit {
            limit: 3,
            used: 3,
            reached: false,
        };
        assert!(data.tunnel_limit_reached().0);

        data.subscription.limits.tunnels = ResourceLimit {
            limit: 3,
            used: 1,
            reached: true,
        };
        assert!(data.tunnel_limit_reached().0);
    }

    #[test]
    fn default_url_follows_tls() {
        assert_eq!(
            default_validation_url("control.haxorport.online", false),
            "http://control.haxorport.online/AuthToken/validate"
        );
        assert_eq!(
            default_validation_url("control.haxorport.online", true),
            "https://control.haxorport.online/AuthToken/validate"
        );
    }
}
