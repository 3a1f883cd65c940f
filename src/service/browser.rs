//! Rendered page fetching through a headless browser.
//!
//! Each rendered fetch launches a browser, navigates with the configured
//! ready condition, runs the pre-extraction actions in order, performs
//! in-page scrolling when scroll pagination is configured, and returns the
//! rendered HTML with the navigation response status (200 when no response
//! was captured, e.g. a tolerated wait timeout).

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventResponseReceived, ResourceType, SetExtraHttpHeadersParams,
    SetUserAgentOverrideParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::domain::config::{OnTimeout, PageAction, Pagination, SiteConfig, WaitUntil};
use crate::domain::models::FetchResult;
use crate::service::fetcher::FetchError;
use crate::service::http::DEFAULT_USER_AGENT;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wrap a page operation with an explicit timeout so a wedged browser
/// never hangs a scrape.
async fn with_page_timeout<F, T>(
    operation: F,
    timeout: Duration,
    operation_name: &str,
) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{operation_name} failed: {e}")),
        Err(_) => Err(format!(
            "{operation_name} timeout after {:.1}s",
            timeout.as_secs_f64()
        )),
    }
}

/// Fetch one page through a headless browser session.
pub async fn fetch_rendered(config: &SiteConfig, url: &str) -> Result<FetchResult, FetchError> {
    let start = Instant::now();

    let browser_config = BrowserConfig::builder()
        .build()
        .map_err(|e| FetchError::transport(url, format!("Failed to configure browser: {e}")))?;
    let (mut browser, mut handler) = Browser::launch(browser_config)
        .await
        .map_err(|e| FetchError::transport(url, format!("Failed to launch browser: {e}")))?;
    // The handler task drives the CDP connection for the whole session.
    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

    let outcome = drive_page(&browser, config, url).await;

    if let Err(e) = browser.close().await {
        log::debug!("Error closing browser: {e}");
    }
    let _ = browser.wait().await;
    handler_task.abort();

    let rendered = outcome.map_err(|reason| FetchError::transport(url, reason))?;
    Ok(FetchResult {
        url: rendered.final_url,
        status_code: rendered.status_code,
        body: rendered.body,
        headers: BTreeMap::new(),
        elapsed: start.elapsed(),
    })
}

struct RenderedPage {
    body: String,
    status_code: u16,
    final_url: String,
}

async fn drive_page(
    browser: &Browser,
    config: &SiteConfig,
    url: &str,
) -> Result<RenderedPage, String> {
    let options = &config.renderer_options;
    let timeout = Duration::from_secs_f64(options.wait_timeout_seconds.max(0.0));
    let tolerate = options.on_timeout == OnTimeout::Proceed;

    let page = with_page_timeout(
        async {
            browser
                .new_page("about:blank")
                .await
                .map_err(anyhow::Error::from)
        },
        timeout,
        "Page creation",
    )
    .await?;

    prepare_page(&page, config, url, timeout).await?;

    // Subscribe before navigating so the document response is not missed.
    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|e| format!("Failed to attach response listener: {e}"))?;

    let navigation = with_page_timeout(
        async {
            page.goto(url).await.map_err(anyhow::Error::from)?;
            Ok(())
        },
        timeout,
        "Navigation",
    )
    .await;
    if let Err(reason) = navigation {
        if !tolerate {
            return Err(reason);
        }
        log::warn!("Navigation timeout for {url}, proceeding anyway: {reason}");
    }

    if let Err(reason) = wait_for_ready(&page, options.wait_until, timeout).await {
        if !tolerate {
            return Err(reason);
        }
        log::warn!("Ready condition not reached for {url}, proceeding anyway: {reason}");
    }

    if let Some(selector) = &options.wait_for_selector {
        if let Err(reason) = wait_for_selector(&page, selector, timeout).await {
            if !tolerate {
                return Err(reason);
            }
            log::warn!(
                "Wait for selector '{selector}' timed out for {url}, proceeding anyway: {reason}"
            );
        }
    }

    for action in &options.actions {
        if let Err(reason) = perform_action(&page, action, timeout).await {
            if !tolerate {
                return Err(reason);
            }
            log::warn!("Action failed for {url}, proceeding anyway: {reason}");
        }
    }

    if let Pagination::Scroll {
        max_pages,
        scroll_wait_seconds,
    } = &config.pagination
    {
        scroll_page(
            &page,
            config.selectors.container.as_deref(),
            *max_pages,
            Duration::from_secs_f64(scroll_wait_seconds.max(0.0)),
            url,
        )
        .await;
    }

    let body = with_page_timeout(
        async { page.content().await.map_err(anyhow::Error::from) },
        timeout,
        "Content extraction",
    )
    .await?;

    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| url.to_string());

    // Take the navigation's document response if one was captured; a
    // tolerated timeout may leave none, which reports as 200.
    let mut status_code = 200u16;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), responses.next()).await
    {
        if event.r#type == ResourceType::Document {
            status_code = event.response.status as u16;
            break;
        }
    }

    Ok(RenderedPage {
        body,
        status_code,
        final_url,
    })
}

/// Apply user agent, extra headers, and cookies to a fresh page.
async fn prepare_page(
    page: &Page,
    config: &SiteConfig,
    url: &str,
    timeout: Duration,
) -> Result<(), String> {
    let user_agent = config
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    with_page_timeout(
        async {
            page.set_user_agent(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(anyhow::Error::from)?;
            Ok(())
        },
        timeout,
        "User agent setup",
    )
    .await?;

    if !config.headers.is_empty() {
        let headers = serde_json::to_value(&config.headers)
            .map_err(|e| format!("Invalid headers: {e}"))?;
        with_page_timeout(
            async {
                page.execute(SetExtraHttpHeadersParams::new(
                    chromiumoxide::cdp::browser_protocol::network::Headers::new(headers),
                ))
                .await
                .map_err(anyhow::Error::from)?;
                Ok(())
            },
            timeout,
            "Header setup",
        )
        .await?;
    }

    if !config.cookies.is_empty() {
        let mut cookies = Vec::with_capacity(config.cookies.len());
        for (name, value) in &config.cookies {
            let cookie = CookieParam::builder()
                .name(name.clone())
                .value(value.clone())
                .url(url.to_string())
                .build()
                .map_err(|e| format!("Invalid cookie '{name}': {e}"))?;
            cookies.push(cookie);
        }
        with_page_timeout(
            async {
                page.set_cookies(cookies).await.map_err(anyhow::Error::from)?;
                Ok(())
            },
            timeout,
            "Cookie setup",
        )
        .await?;
    }

    Ok(())
}

/// Poll `document.readyState` until the configured condition holds.
async fn wait_for_ready(page: &Page, wait_until: WaitUntil, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    loop {
        let ready_state = page
            .evaluate("document.readyState")
            .await
            .ok()
            .and_then(|result| result.into_value::<String>().ok())
            .unwrap_or_default();

        let ready = match wait_until {
            WaitUntil::Domcontentloaded => ready_state == "interactive" || ready_state == "complete",
            WaitUntil::Load | WaitUntil::Networkidle => ready_state == "complete",
        };
        if ready {
            // "complete" only says the load event fired; give in-flight
            // requests a moment to settle for networkidle.
            if wait_until == WaitUntil::Networkidle {
                sleep(Duration::from_millis(500)).await;
            }
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "Ready condition '{wait_until:?}' timeout after {:.1}s",
                timeout.as_secs_f64()
            ));
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "Wait for selector '{selector}' timeout after {:.1}s",
                timeout.as_secs_f64()
            ));
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

async fn perform_action(page: &Page, action: &PageAction, timeout: Duration) -> Result<(), String> {
    match action {
        PageAction::Click { selector } => {
            with_page_timeout(
                async {
                    let element = page.find_element(selector.as_str()).await?;
                    element.click().await?;
                    Ok(())
                },
                timeout,
                "Action 'click'",
            )
            .await
        }
        PageAction::Wait { seconds } => {
            sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            Ok(())
        }
        PageAction::Fill { selector, value } => {
            with_page_timeout(
                async {
                    let element = page.find_element(selector.as_str()).await?;
                    element.click().await?;
                    element.type_str(value.as_str()).await?;
                    Ok(())
                },
                timeout,
                "Action 'fill'",
            )
            .await
        }
        PageAction::Press { selector, key } => {
            with_page_timeout(
                async {
                    let element = page.find_element(selector.as_str()).await?;
                    element.press_key(key.as_str()).await?;
                    Ok(())
                },
                timeout,
                "Action 'press'",
            )
            .await
        }
        PageAction::Hover { selector } => {
            with_page_timeout(
                async {
                    let element = page.find_element(selector.as_str()).await?;
                    let point = element.clickable_point().await?;
                    page.move_mouse(point).await?;
                    Ok(())
                },
                timeout,
                "Action 'hover'",
            )
            .await
        }
    }
}

/// Scroll to the bottom up to `max_scrolls` times, stopping early when the
/// container element count stops growing.
async fn scroll_page(
    page: &Page,
    container_selector: Option<&str>,
    max_scrolls: i64,
    scroll_wait: Duration,
    url: &str,
) {
    let count_containers = |page: &Page, selector: Option<&str>| {
        let page = page.clone();
        let selector = selector.map(str::to_string);
        async move {
            match selector {
                Some(selector) => page
                    .find_elements(selector.as_str())
                    .await
                    .map(|elements| elements.len())
                    .unwrap_or(0),
                None => 0,
            }
        }
    };

    let mut last_count = count_containers(page, container_selector).await;
    for i in 0..max_scrolls {
        log::info!("Scrolling iteration {}/{} for {}", i + 1, max_scrolls, url);
        if let Err(e) = page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
        {
            log::warn!("Scroll evaluation failed for {url}: {e}");
            break;
        }
        sleep(scroll_wait).await;

        if container_selector.is_some() {
            let new_count = count_containers(page, container_selector).await;
            if new_count <= last_count {
                log::info!("No new content detected after scroll {}. Stopping.", i + 1);
                break;
            }
            last_count = new_count;
        }
    }
}
