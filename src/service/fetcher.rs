//! Plain HTTP fetching and the shared fetch contract.
//!
//! Every page fetch (plain or rendered) funnels through [`fetch`], which
//! routes the request through the origin's rate limiter and attaches a
//! `FailureContext` to the active scrape result when retries are
//! exhausted. The session client carries the login state for one site
//! scrape: cookie jar plus any extracted token header.

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

use crate::domain::config::{HttpMethod, Renderer, SiteConfig, TokenFrom};
use crate::domain::models::{FailureContext, FetchResult, ScrapeResult};
use crate::service::browser;
use crate::service::http;
use crate::service::parser;
use crate::service::rate_limiter::limiter_for_url;

/// A fetch failed at the transport level (connect, timeout, TLS, browser).
#[derive(Debug, Error)]
#[error("Failed to fetch {url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
    pub status: Option<u16>,
}

impl FetchError {
    pub fn transport(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
            status: None,
        }
    }
}

/// Request body for the login step.
pub enum RequestBody {
    Json(Value),
    Query(Value),
}

/// HTTP session for one site scrape: a cookie-jar client plus headers
/// installed by the login step.
pub struct SessionClient {
    client: Client,
    cookies: BTreeMap<String, String>,
    extra_headers: HeaderMap,
}

impl SessionClient {
    pub fn new(config: &SiteConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http::create_session_client(&config.headers)?,
            cookies: config.cookies.clone(),
            extra_headers: HeaderMap::new(),
        })
    }

    /// Issue one request and normalize the response into a `FetchResult`.
    /// Redirects are followed; the final URL is reported.
    pub async fn request(
        &self,
        method: &HttpMethod,
        url: &str,
        body: Option<&RequestBody>,
    ) -> Result<FetchResult, FetchError> {
        let http_method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut request = self.client.request(http_method, url);
        if let Some(cookie) = http::cookie_header(&self.cookies) {
            request = request.header(COOKIE, cookie);
        }
        request = request.headers(self.extra_headers.clone());
        match body {
            Some(RequestBody::Json(value)) => request = request.json(value),
            Some(RequestBody::Query(value)) => {
                if let Some(map) = value.as_object() {
                    let pairs: Vec<(String, String)> = map
                        .iter()
                        .map(|(k, v)| {
                            let rendered = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), rendered)
                        })
                        .collect();
                    request = request.query(&pairs);
                }
            }
            None => {}
        }

        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e.to_string()))?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = header_map_to_btree(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::transport(url, e.to_string()))?;

        Ok(FetchResult {
            url: final_url,
            status_code,
            body,
            headers,
            elapsed: start.elapsed(),
        })
    }

    fn install_auth_header(&mut self, value: &str) -> bool {
        match HeaderValue::try_from(value) {
            Ok(header_value) => {
                self.extra_headers.insert(AUTHORIZATION, header_value);
                true
            }
            Err(_) => {
                log::error!("Extracted token is not a legal header value; ignoring");
                false
            }
        }
    }
}

fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Fetch one page for a site, through the origin's politeness gate and
/// retry policy. On a >= 400 status after retries or an exhausted
/// transport failure, a `FailureContext` is attached to `result` before
/// returning.
pub async fn fetch(
    config: &SiteConfig,
    session: &SessionClient,
    url: &str,
    result: &mut ScrapeResult,
) -> Result<FetchResult, FetchError> {
    let limiter = limiter_for_url(url, &config.rate_limit, &config.retry);

    let outcome = limiter
        .execute(url, &config.site_name, || async {
            match config.renderer {
                Renderer::Plain => session.request(&config.method, url, None).await,
                Renderer::Headless => browser::fetch_rendered(config, url).await,
            }
        })
        .await;

    match outcome {
        Ok(fetch_res) => {
            if fetch_res.status_code >= 400 {
                result.failure_contexts.push(FailureContext {
                    site_name: config.site_name.clone(),
                    url: url.to_string(),
                    http_status: Some(fetch_res.status_code),
                    error_type: "HTTPError".to_string(),
                    error_message: format!("HTTP {} error", fetch_res.status_code),
                    retries_attempted: limiter.max_retries(),
                    timestamp: Utc::now(),
                });
            }
            Ok(fetch_res)
        }
        Err(err) => {
            result.failure_contexts.push(FailureContext {
                site_name: config.site_name.clone(),
                url: url.to_string(),
                http_status: err.status,
                error_type: "FetchError".to_string(),
                error_message: err.to_string(),
                retries_attempted: limiter.max_retries(),
                timestamp: Utc::now(),
            });
            Err(err)
        }
    }
}

/// Perform the configured login request and install the extracted token on
/// the session. Login failures are logged and leave the session untouched;
/// the scrape proceeds unauthenticated.
pub async fn perform_login(session: &mut SessionClient, config: &SiteConfig) {
    let Some(auth) = &config.auth else {
        return;
    };

    let body = auth.payload.as_ref().map(|payload| match auth.method {
        HttpMethod::Post => RequestBody::Json(payload.clone()),
        HttpMethod::Get => RequestBody::Query(payload.clone()),
    });

    let limiter = limiter_for_url(&auth.login_url, &config.rate_limit, &config.retry);
    let body_ref = body.as_ref();
    let session_ref: &SessionClient = &*session;
    let response = limiter
        .execute(&auth.login_url, &config.site_name, move || {
            session_ref.request(&auth.method, &auth.login_url, body_ref)
        })
        .await;

    let response = match response {
        Ok(res) if res.status_code >= 400 => {
            log::error!(
                "Login failed with status {} for {}",
                res.status_code,
                auth.login_url
            );
            return;
        }
        Ok(res) => res,
        Err(e) => {
            log::error!("Error during login to {}: {}", auth.login_url, e);
            return;
        }
    };

    let Some(token_from) = &auth.token_from else {
        return;
    };
    extract_token(session, token_from, &response, &auth.login_url);
}

fn extract_token(
    session: &mut SessionClient,
    token_from: &TokenFrom,
    response: &FetchResult,
    login_url: &str,
) {
    match token_from {
        TokenFrom::Header { name } => {
            let Some(value) = response.headers.get(&name.to_ascii_lowercase()).cloned() else {
                log::warn!("Login response has no '{name}' header for token extraction");
                return;
            };
            install_token(session, name, &value);
        }
        TokenFrom::Cookie { name } => {
            // The cookie jar already holds the session cookie; this only
            // verifies the login actually set it.
            let set_cookie = response.headers.get("set-cookie");
            if set_cookie.is_some_and(|v| v.contains(&format!("{name}="))) {
                log::info!("Session cookie '{name}' captured from login response");
            } else {
                log::warn!("Login response did not set cookie '{name}'");
            }
        }
        TokenFrom::BodyJson { name } => {
            let parsed: Result<Value, _> = serde_json::from_str(&response.body);
            let Ok(parsed) = parsed else {
                log::error!("Failed to decode JSON body for token extraction from {login_url}");
                return;
            };
            let Some(value) = parsed.get(name).and_then(Value::as_str).map(str::to_owned) else {
                log::warn!("Login body has no string field '{name}' for token extraction");
                return;
            };
            install_token(session, name, &value);
        }
        TokenFrom::BodySelector { selector, kind } => {
            let value = match parser::parse_field(&response.body, selector, *kind) {
                Ok(value) => scalar_string(&value),
                Err(e) => {
                    log::error!("Token selector failed on login body: {e}");
                    return;
                }
            };
            let Some(value) = value else {
                log::warn!("Token selector '{selector}' matched nothing in login body");
                return;
            };
            if session.install_auth_header(&format!("Bearer {value}")) {
                log::info!("Successfully extracted token from body_selector");
            }
        }
    }
}

fn install_token(session: &mut SessionClient, name: &str, value: &str) {
    let header_value = if name.to_ascii_lowercase().contains("token") {
        format!("Bearer {value}")
    } else {
        value.to_string()
    };
    if session.install_auth_header(&header_value) {
        log::info!("Successfully extracted token '{name}' from login response");
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(|v| v.as_str().map(str::to_owned)),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(base_url: &str) -> SiteConfig {
        SiteConfig::from_value(&json!({
            "version": "1.0",
            "site_name": "fetch-test",
            "base_url": base_url,
            "rate_limit": {"delay_seconds": 0.001, "max_concurrent": 4},
            "retry": {"max_retries": 0, "backoff_factor": 0.01},
            "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn plain_fetch_returns_status_body_and_final_url() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><body>ok</body></html>")
            .create_async()
            .await;

        let config = test_config(&server.url());
        let session = SessionClient::new(&config).unwrap();
        let mut result = ScrapeResult::new("fetch-test");
        let url = format!("{}/page", server.url());

        let fetched = fetch(&config, &session, &url, &mut result).await.unwrap();
        assert_eq!(fetched.status_code, 200);
        assert!(fetched.body.contains("ok"));
        assert!(fetched.url.ends_with("/page"));
        assert_eq!(fetched.headers.get("content-type").unwrap(), "text/html");
        assert!(result.failure_contexts.is_empty());
    }

    #[tokio::test]
    async fn config_headers_and_cookies_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/page")
            .match_header("x-api-key", "secret")
            .match_header("cookie", "session=abc")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let mut value = json!({
            "version": "1.0",
            "site_name": "fetch-test",
            "base_url": server.url(),
            "headers": {"X-Api-Key": "secret"},
            "cookies": {"session": "abc"},
            "rate_limit": {"delay_seconds": 0.001, "max_concurrent": 4},
            "retry": {"max_retries": 0, "backoff_factor": 0.01},
            "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}}
        });
        value["base_url"] = json!(server.url());
        let config = SiteConfig::from_value(&value).unwrap();
        let session = SessionClient::new(&config).unwrap();
        let mut result = ScrapeResult::new("fetch-test");
        let url = format!("{}/page", server.url());

        let fetched = fetch(&config, &session, &url, &mut result).await.unwrap();
        assert_eq!(fetched.status_code, 200);
    }

    #[tokio::test]
    async fn http_error_attaches_failure_context() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let config = test_config(&server.url());
        let session = SessionClient::new(&config).unwrap();
        let mut result = ScrapeResult::new("fetch-test");
        let url = format!("{}/missing", server.url());

        let fetched = fetch(&config, &session, &url, &mut result).await.unwrap();
        assert_eq!(fetched.status_code, 404);
        assert_eq!(result.failure_contexts.len(), 1);
        let ctx = &result.failure_contexts[0];
        assert_eq!(ctx.http_status, Some(404));
        assert_eq!(ctx.error_type, "HTTPError");
    }

    #[tokio::test]
    async fn transport_failure_attaches_failure_context_and_propagates() {
        // A server that is immediately dropped leaves a refused port.
        let server = mockito::Server::new_async().await;
        let url = format!("{}/gone", server.url());
        drop(server);

        let config = test_config(&url);
        let session = SessionClient::new(&config).unwrap();
        let mut result = ScrapeResult::new("fetch-test");

        let err = fetch(&config, &session, &url, &mut result).await.unwrap_err();
        assert!(err.to_string().contains("Failed to fetch"));
        assert_eq!(result.failure_contexts.len(), 1);
        assert_eq!(result.failure_contexts[0].error_type, "FetchError");
        assert_eq!(result.failure_contexts[0].http_status, None);
    }

    #[tokio::test]
    async fn login_extracts_body_json_token() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/login")
            .with_status(200)
            .with_body(r#"{"token": "abc123"}"#)
            .create_async()
            .await;
        let _page = server
            .mock("GET", "/data")
            .match_header("authorization", "Bearer abc123")
            .with_status(200)
            .with_body("authorized")
            .create_async()
            .await;

        let mut value = json!({
            "version": "1.0",
            "site_name": "login-test",
            "base_url": server.url(),
            "auth": {
                "login_url": format!("{}/login", server.url()),
                "method": "POST",
                "payload": {"user": "u", "pass": "p"},
                "token_from": {"type": "body_json", "name": "token"}
            },
            "rate_limit": {"delay_seconds": 0.001, "max_concurrent": 4},
            "retry": {"max_retries": 0, "backoff_factor": 0.01},
            "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}}
        });
        value["base_url"] = json!(server.url());
        let config = SiteConfig::from_value(&value).unwrap();
        let mut session = SessionClient::new(&config).unwrap();

        perform_login(&mut session, &config).await;

        let mut result = ScrapeResult::new("login-test");
        let url = format!("{}/data", server.url());
        let fetched = fetch(&config, &session, &url, &mut result).await.unwrap();
        assert_eq!(fetched.status_code, 200);
        assert_eq!(fetched.body, "authorized");
    }
}
