//! HTTP request proxy for HTTP tunnels.
//!
//! The server forwards each visitor request as an `http_request` frame.
//! This handler replays it against the local service (always plain HTTP,
//! whatever the public scheme was), rewrites absolute and root-relative
//! URLs in HTML bodies so links keep pointing at the tunnel, and answers
//! with an `http_response` frame carrying the original request id. Any
//! failure turns into a status-500 response with the error string.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{error, info};

use crate::protocol::{
    http_response_message, parse_http_request, Headers, HttpRequest, HttpResponse, Message,
    MessageType,
};
use crate::session::{Session, SessionError};

type ProxyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Replays forwarded requests against the local service.
pub struct HttpProxy {
    session: Arc<Session>,
    http: reqwest::Client,
    base_domain: String,
}

impl HttpProxy {
    /// Build the proxy and install it as the `http_request` handler.
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let base_domain = session.config().base_domain.clone();
        let http = reqwest::Client::builder().build().unwrap_or_default();
        let proxy = Arc::new(Self {
            session,
            http,
            base_domain,
        });

        let handler = Arc::clone(&proxy);
        proxy
            .session
            .register_handler(MessageType::HttpRequest, move |msg| {
                let proxy = Arc::clone(&handler);
                async move { proxy.handle_request(msg).await }
            });

        proxy
    }

    async fn handle_request(&self, msg: Message) -> Result<(), SessionError> {
        let request = parse_http_request(&msg)?;
        info!("Received HTTP request: {} {}", request.method, request.url);

        let response = match self.proxy_to_local(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to proxy request {} to local service: {e}", request.id);
                HttpResponse {
                    id: request.id.clone(),
                    status_code: 500,
                    headers: Headers::new(),
                    body: Vec::new(),
                    error: e.to_string(),
                }
            }
        };

        let reply = http_response_message(response)?;
        self.session.send(&reply).await
    }

    async fn proxy_to_local(&self, request: &HttpRequest) -> ProxyResult<HttpResponse> {
        // The local service speaks plain HTTP regardless of the
        // client-facing scheme.
        let target = format!("http://localhost:{}{}", request.local_port, request.url);
        info!("Sending request to local service: {target}");

        let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
        let scheme = request.scheme.as_deref().unwrap_or("http");

        let mut headers = HeaderMap::new();
        for (name, values) in &request.headers {
            // Host belongs to the target URL; the original rides in
            // X-Forwarded-Host.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(header_name.clone(), value);
                }
            }
        }
        if let Some(host) = request.header("Host") {
            headers.insert("x-forwarded-host", HeaderValue::from_str(host)?);
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_str(scheme)?);
        if !request.remote_addr.is_empty() {
            headers.insert("x-forwarded-for", HeaderValue::from_str(&request.remote_addr)?);
        }

        let mut builder = self.http.request(method, &target).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        info!("Local service responded with status: {status_code}");

        let mut out_headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                out_headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(text.to_string());
            }
        }

        let mut body = response.bytes().await?.to_vec();

        let content_type = header_value(&out_headers, "content-type").unwrap_or_default();
        if content_type.starts_with("text/html") {
            if let Ok(text) = String::from_utf8(body.clone()) {
                let hostname = self.resolve_hostname(request);
                info!("Using hostname: {hostname} for URL replacement");
                body = rewrite_html(&text, request.local_port, scheme, &hostname).into_bytes();
            }
        }

        Ok(HttpResponse {
            id: request.id.clone(),
            status_code,
            headers: out_headers,
            body,
            error: String::new(),
        })
    }

    /// Public hostname of the tunnel, in order of preference: the inbound
    /// `Host` header, `X-Forwarded-Host`, the configured subdomain under
    /// the base domain, and the tunnel id under the base domain.
    fn resolve_hostname(&self, request: &HttpRequest) -> String {
        if let Some(host) = request.header("Host") {
            if !host.is_empty() {
                return host.to_string();
            }
        }
        if let Some(host) = request.header("X-Forwarded-Host") {
            if !host.is_empty() {
                return host.to_string();
            }
        }
        let subdomain = self.session.subdomain();
        if !subdomain.is_empty() {
            return format!("{subdomain}.{}", self.base_domain);
        }
        format!("{}.{}", request.tunnel_id, self.base_domain)
    }
}

fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.first())
        .cloned()
}

/// Point local URLs at the tunnel: absolute `http(s)://localhost:{port}`
/// prefixes and root-relative `href="/…"` / `src="/…"` attributes both
/// become `{scheme}://{hostname}…`. Applying this twice is a no-op.
pub(crate) fn rewrite_html(body: &str, local_port: u16, scheme: &str, hostname: &str) -> String {
    let local = format!("http://localhost:{local_port}");
    let local_tls = format!("https://localhost:{local_port}");
    let public = format!("{scheme}://{hostname}");

    let body = body.replace(&local, &public).replace(&local_tls, &public);
    let body = body.replace("href=\"/", &format!("href=\"{public}/"));
    body.replace("src=\"/", &format!("src=\"{public}/"))
}
