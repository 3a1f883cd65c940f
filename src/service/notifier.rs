//! Gotify push notifications.
//!
//! Notification failures are logged at warning level and swallowed; a
//! broken notifier never affects scrape outcomes.

use serde::Serialize;

use crate::domain::config::GotifyConfig;
use crate::domain::models::{FailureContext, RunSummary};
use crate::service::http::{create_bare_client, NOTIFY_TIMEOUT};

#[derive(Serialize)]
struct GotifyMessage<'a> {
    title: &'a str,
    message: &'a str,
    priority: i64,
}

/// Thin client for a Gotify push endpoint. Disabled unless both server URL
/// and app token are configured.
pub struct GotifyNotifier {
    server_url: Option<String>,
    app_token: Option<String>,
    priority: i64,
}

impl GotifyNotifier {
    pub fn new(config: Option<&GotifyConfig>) -> Self {
        let config = config.cloned().unwrap_or_default();
        Self {
            server_url: config.server_url.filter(|s| !s.is_empty()),
            app_token: config.app_token.filter(|s| !s.is_empty()),
            priority: config.priority,
        }
    }

    pub fn disabled() -> Self {
        Self {
            server_url: None,
            app_token: None,
            priority: 5,
        }
    }

    pub fn enabled(&self) -> bool {
        self.server_url.is_some() && self.app_token.is_some()
    }

    async fn send(&self, title: &str, message: &str) -> bool {
        let (Some(server_url), Some(app_token)) = (&self.server_url, &self.app_token) else {
            return false;
        };

        let url = format!("{}/message", server_url.trim_end_matches('/'));
        let client = match create_bare_client(NOTIFY_TIMEOUT) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("Could not build notification client: {e}");
                return false;
            }
        };

        let payload = GotifyMessage {
            title,
            message,
            priority: self.priority,
        };
        match client
            .post(&url)
            .header("X-Gotify-Key", app_token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!("Gotify server returned error: {}", response.status());
                false
            }
            Err(e) => {
                log::warn!("Could not reach Gotify server: {e}");
                false
            }
        }
    }

    /// Post one message for a site failure.
    pub async fn send_error(&self, failure: &FailureContext) -> bool {
        if !self.enabled() {
            return false;
        }
        let title = format!("CWSF Scrape Error: {}", failure.site_name);
        let mut message = format!(
            "Site: {}\nURL: {}\nError: {}\n",
            failure.site_name, failure.url, failure.error_message
        );
        if let Some(status) = failure.http_status {
            message.push_str(&format!("Status: {status}\n"));
        }
        if failure.retries_attempted > 0 {
            message.push_str(&format!("Retries: {}\n", failure.retries_attempted));
        }
        self.send(&title, &message).await
    }

    /// Post a single summary message, but only when at least one site
    /// failed in the run.
    pub async fn send_summary(&self, summary: &RunSummary) -> bool {
        if !self.enabled() || summary.sites_failed == 0 {
            return false;
        }
        let title = "CWSF Run Summary (Failures Detected)";
        let mut message = format!(
            "Sites Attempted: {}\nSites Succeeded: {}\nSites Failed: {}\nTotal Records: {}\nDuration: {:.1}s\n\nFailed Sites:\n",
            summary.total_sites,
            summary.sites_succeeded,
            summary.sites_failed,
            summary.total_records,
            summary.duration_seconds
        );
        for (site, error) in &summary.failed_sites {
            message.push_str(&format!("- {site}: {error}\n"));
        }
        self.send(title, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn failure() -> FailureContext {
        FailureContext {
            site_name: "books".into(),
            url: "http://h/books".into(),
            http_status: Some(503),
            error_type: "HTTPError".into(),
            error_message: "HTTP 503 error".into(),
            retries_attempted: 2,
            timestamp: Utc::now(),
        }
    }

    fn summary(failed: usize) -> RunSummary {
        let mut failed_sites = std::collections::BTreeMap::new();
        if failed > 0 {
            failed_sites.insert("books".to_string(), "HTTP 503 error".to_string());
        }
        RunSummary {
            total_sites: 2,
            sites_succeeded: 2 - failed,
            sites_failed: failed,
            total_records: 10,
            total_errors: failed,
            duration_seconds: 1.5,
            failed_sites,
        }
    }

    #[tokio::test]
    async fn disabled_without_url_and_token() {
        let notifier = GotifyNotifier::new(None);
        assert!(!notifier.enabled());
        assert!(!notifier.send_error(&failure()).await);

        let partial = GotifyConfig {
            server_url: Some("http://gotify.local".into()),
            app_token: None,
            priority: 5,
        };
        assert!(!GotifyNotifier::new(Some(&partial)).enabled());
    }

    #[tokio::test]
    async fn posts_error_with_token_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/message")
            .match_header("x-gotify-key", "tok")
            .with_status(200)
            .create_async()
            .await;

        let config = GotifyConfig {
            server_url: Some(server.url()),
            app_token: Some("tok".into()),
            priority: 5,
        };
        let notifier = GotifyNotifier::new(Some(&config));
        assert!(notifier.send_error(&failure()).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn summary_is_skipped_without_failures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/message")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let config = GotifyConfig {
            server_url: Some(server.url()),
            app_token: Some("tok".into()),
            priority: 5,
        };
        let notifier = GotifyNotifier::new(Some(&config));
        assert!(!notifier.send_summary(&summary(0)).await);
        mock.assert_async().await;

        // With a failure the summary is posted.
        let mock = server
            .mock("POST", "/message")
            .with_status(200)
            .create_async()
            .await;
        assert!(notifier.send_summary(&summary(1)).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transport_errors_are_swallowed() {
        let server = mockito::Server::new_async().await;
        let url = server.url();
        drop(server);

        let config = GotifyConfig {
            server_url: Some(url),
            app_token: Some("tok".into()),
            priority: 5,
        };
        let notifier = GotifyNotifier::new(Some(&config));
        // Returns false instead of propagating the error.
        assert!(!notifier.send_error(&failure()).await);
    }
}
