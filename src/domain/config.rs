//! Typed site configuration model.
//!
//! A `SiteConfig` is produced from a YAML document after defaulting and
//! validation; the tagged enums here (paginator kind, token source, page
//! actions) make the variant invariants explicit so the engine code is
//! total. Untyped `serde_json::Value` documents only exist inside the
//! loader/validator layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// HTTP request method for page fetches and login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Engine used for fetching pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Renderer {
    /// Plain HTTP transport
    #[default]
    Plain,
    /// Headless browser transport
    Headless,
}

/// When to consider a rendered navigation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    #[default]
    Load,
    Domcontentloaded,
    Networkidle,
}

/// Action to take when a rendered wait condition times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnTimeout {
    #[default]
    Proceed,
    Fail,
}

/// Pre-extraction page action performed by the headless renderer, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PageAction {
    Click { selector: String },
    Wait { seconds: f64 },
    Fill { selector: String, value: String },
    Press { selector: String, key: String },
    Hover { selector: String },
}

/// Options for the headless renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererOptions {
    #[serde(default)]
    pub wait_until: WaitUntil,
    #[serde(default)]
    pub wait_for_selector: Option<String>,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_seconds: f64,
    #[serde(default)]
    pub on_timeout: OnTimeout,
    #[serde(default)]
    pub actions: Vec<PageAction>,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::default(),
            wait_for_selector: None,
            wait_timeout_seconds: default_wait_timeout(),
            on_timeout: OnTimeout::default(),
            actions: Vec::new(),
        }
    }
}

fn default_wait_timeout() -> f64 {
    30.0
}

/// Selector expression kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Css,
    Xpath,
}

/// Value post-processing applied to an extracted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Strip,
    Regex,
    Cast,
    Default,
}

/// Target type for the `cast` transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastType {
    Int,
    Float,
    Bool,
    Str,
}

/// A single extraction field: where it comes from and how to post-process it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub selector: String,
    #[serde(default)]
    pub kind: SelectorKind,
    #[serde(default)]
    pub transform: Option<TransformKind>,
    #[serde(default)]
    pub transform_pattern: Option<String>,
    #[serde(default)]
    pub cast_type: Option<CastType>,
    /// Substituted for absent or empty-string values, always after the
    /// named transform.
    #[serde(default)]
    pub default: Option<Value>,
}

/// The `selectors` block: container enumeration plus field mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorsConfig {
    #[serde(default)]
    pub container: Option<String>,
    pub fields: BTreeMap<String, FieldConfig>,
}

/// Pagination strategy, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pagination {
    None,
    UrlPattern {
        #[serde(default = "default_page_param")]
        param: String,
        #[serde(default = "default_start")]
        start: i64,
        #[serde(default = "default_max_pages")]
        max_pages: i64,
    },
    NextLink {
        selector: String,
        #[serde(default)]
        selector_kind: SelectorKind,
        #[serde(default = "default_max_pages")]
        max_pages: i64,
    },
    Scroll {
        #[serde(default = "default_max_pages")]
        max_pages: i64,
        #[serde(default = "default_scroll_wait")]
        scroll_wait_seconds: f64,
    },
}

impl Default for Pagination {
    fn default() -> Self {
        Self::None
    }
}

impl Pagination {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::UrlPattern { .. } => "url_pattern",
            Self::NextLink { .. } => "next_link",
            Self::Scroll { .. } => "scroll",
        }
    }
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_start() -> i64 {
    1
}

fn default_max_pages() -> i64 {
    1
}

fn default_scroll_wait() -> f64 {
    2.0
}

/// How existing rows for the same site are handled by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Append,
    Overwrite,
}

/// Output sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: String,
    #[serde(default = "default_output_destination")]
    pub destination: String,
    #[serde(default)]
    pub mode: OutputMode,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            destination: default_output_destination(),
            mode: OutputMode::default(),
        }
    }
}

fn default_output_format() -> String {
    "sqlite".to_string()
}

fn default_output_destination() -> String {
    "./output/".to_string()
}

/// Per-origin politeness settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            delay_seconds: default_delay_seconds(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_delay_seconds() -> f64 {
    1.0
}

fn default_max_concurrent() -> u32 {
    1
}

/// Retry policy for transient fetch failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    2.0
}

/// Where to extract the session token from after login, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenFrom {
    Header {
        name: String,
    },
    Cookie {
        name: String,
    },
    BodyJson {
        name: String,
    },
    BodySelector {
        selector: String,
        #[serde(default)]
        kind: SelectorKind,
    },
}

/// Single login step performed at scrape start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub login_url: String,
    #[serde(default = "default_auth_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub token_from: Option<TokenFrom>,
}

fn default_auth_method() -> HttpMethod {
    HttpMethod::Post
}

/// Gotify push endpoint settings. Disabled unless both URL and token are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GotifyConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub app_token: Option<String>,
    #[serde(default = "default_gotify_priority")]
    pub priority: i64,
}

impl Default for GotifyConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            app_token: None,
            priority: default_gotify_priority(),
        }
    }
}

fn default_gotify_priority() -> i64 {
    5
}

/// Informational schedule hint, shown by `cwsf list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub every: Option<String>,
}

/// A fully decoded scraping target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub version: String,
    pub site_name: String,
    pub base_url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub renderer: Renderer,
    #[serde(default)]
    pub renderer_options: RendererOptions,
    pub selectors: SelectorsConfig,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub gotify: GotifyConfig,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

pub fn default_priority() -> i64 {
    10
}

impl SiteConfig {
    /// Decode a validated, defaulted document into the typed model.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("config does not match the typed model: {e}"))
    }
}
