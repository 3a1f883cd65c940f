//! Factory for HTTP clients used across the framework.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default per-request timeout for page fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed timeout for notification posts.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = "CWSF/1.0";

/// Build a session client for one site scrape: cookie jar for the login
/// session, redirects followed, site headers applied to every request.
pub fn create_session_client(headers: &BTreeMap<String, String>) -> Result<Client> {
    Client::builder()
        .timeout(FETCH_TIMEOUT)
        .cookie_store(true)
        .default_headers(build_header_map(headers)?)
        .user_agent(DEFAULT_USER_AGENT)
        .build()
        .context("Failed to build session HTTP client")
}

/// Build a bare client with the given timeout (notifier, one-off posts).
pub fn create_bare_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(DEFAULT_USER_AGENT)
        .build()
        .context("Failed to build HTTP client")
}

/// Convert a config header mapping into a reqwest header map, rejecting
/// names or values that are not legal header syntax.
pub fn build_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::try_from(name.as_str())
            .with_context(|| format!("Invalid header name '{name}'"))?;
        let header_value = HeaderValue::try_from(value.as_str())
            .with_context(|| format!("Invalid header value for '{name}'"))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Render a cookie mapping as a single `Cookie:` header value.
pub fn cookie_header(cookies: &BTreeMap<String, String>) -> Option<HeaderValue> {
    if cookies.is_empty() {
        return None;
    }
    let joined = cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::try_from(joined).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_rejects_bad_names() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Ok".to_string(), "1".to_string());
        assert!(build_header_map(&headers).is_ok());

        headers.insert("bad header".to_string(), "1".to_string());
        assert!(build_header_map(&headers).is_err());
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let mut cookies = BTreeMap::new();
        assert!(cookie_header(&cookies).is_none());
        cookies.insert("a".to_string(), "1".to_string());
        cookies.insert("b".to_string(), "2".to_string());
        let value = cookie_header(&cookies).unwrap();
        assert_eq!(value.to_str().unwrap(), "a=1; b=2");
    }

    #[test]
    fn user_agent_default_is_applied() {
        // The UA string is part of the wire contract for polite scraping.
        assert_eq!(DEFAULT_USER_AGENT, "CWSF/1.0");
    }
}
