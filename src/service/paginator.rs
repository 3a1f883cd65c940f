//! Pagination strategies.
//!
//! The paginator decides the first URL, when to stop, and where to go
//! next. Scroll pagination produces no next URLs at all: the scrolling
//! happens inside the rendered page session, so the strategy here stops
//! after the single page load. Every strategy stops when the last page
//! produced zero records.

use std::collections::HashSet;
use url::Url;

use crate::domain::config::{Pagination, SelectorKind, SiteConfig};
use crate::domain::models::FetchResult;
use crate::service::parser;

pub enum Paginator {
    None,
    UrlPattern {
        base_url: String,
        placeholder: String,
        start: i64,
        max_pages: i64,
    },
    NextLink {
        selector: String,
        kind: SelectorKind,
        max_pages: i64,
        visited: HashSet<String>,
    },
    Scroll,
}

impl Paginator {
    pub fn new(config: &SiteConfig) -> Self {
        match &config.pagination {
            Pagination::None => Self::None,
            Pagination::UrlPattern {
                param,
                start,
                max_pages,
            } => Self::UrlPattern {
                base_url: config.base_url.clone(),
                placeholder: format!("{{{param}}}"),
                start: *start,
                max_pages: *max_pages,
            },
            Pagination::NextLink {
                selector,
                selector_kind,
                max_pages,
            } => Self::NextLink {
                selector: selector.clone(),
                kind: *selector_kind,
                max_pages: *max_pages,
                visited: HashSet::new(),
            },
            Pagination::Scroll { .. } => Self::Scroll,
        }
    }

    /// URL of the first page. URL-template pagination substitutes the
    /// start index into the placeholder.
    pub fn first_url(&self, base_url: &str) -> String {
        match self {
            Self::UrlPattern {
                base_url,
                placeholder,
                start,
                ..
            } => base_url.replace(placeholder.as_str(), &start.to_string()),
            _ => base_url.to_string(),
        }
    }

    /// Whether to stop after the page that just completed.
    /// `pages_fetched` counts completed page fetches.
    pub fn should_stop(&self, pages_fetched: u32, num_records: usize) -> bool {
        match self {
            Self::None | Self::Scroll => true,
            Self::UrlPattern { max_pages, .. } | Self::NextLink { max_pages, .. } => {
                pages_fetched as i64 >= *max_pages || num_records == 0
            }
        }
    }

    /// The next URL to fetch, or `None` when pagination is finished.
    pub fn next_url(&mut self, last_response: &FetchResult, pages_fetched: u32) -> Option<String> {
        match self {
            Self::None | Self::Scroll => None,
            Self::UrlPattern {
                base_url,
                placeholder,
                start,
                max_pages,
            } => {
                let target = *start + pages_fetched as i64;
                if target >= *start + *max_pages {
                    return None;
                }
                Some(base_url.replace(placeholder.as_str(), &target.to_string()))
            }
            Self::NextLink {
                selector,
                kind,
                visited,
                ..
            } => {
                visited.insert(last_response.url.clone());

                let href = match parser::extract_href(&last_response.body, selector, *kind) {
                    Ok(Some(href)) => href,
                    Ok(None) => return None,
                    Err(e) => {
                        log::warn!("Next link selector failed: {e}");
                        return None;
                    }
                };

                let next_url = match Url::parse(&last_response.url) {
                    Ok(current) => match current.join(&href) {
                        Ok(joined) => joined.to_string(),
                        Err(_) => href,
                    },
                    Err(_) => href,
                };

                if visited.contains(&next_url) {
                    log::warn!("Pagination cycle detected: {next_url} already visited. Stopping.");
                    return None;
                }
                Some(next_url)
            }
        }
    }
}
