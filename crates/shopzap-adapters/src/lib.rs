//! Site adapter registry, field extraction engine and page renderers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use shopzap_core::{ExtractionRecord, StockStatus};
use shopzap_storage::{FetchError, HttpFetcher};
use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "shopzap-adapters";

/// Name of the fallback adapter that reads a caller-supplied descriptor.
pub const DEFAULT_ADAPTER: &str = "default";

/// Search results examined per query.
pub const SEARCH_RESULT_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("browser session error: {0}")]
    Browser(String),
    #[error("render pool is closed")]
    PoolClosed,
}

impl From<WebDriverError> for RenderError {
    fn from(err: WebDriverError) -> Self {
        Self::Browser(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Selector is required for default scraping.")]
    DescriptorRequired,
    #[error("Could not scrape data. Element(s) not found or site not supported. ({url})")]
    ExtractionFailed { url: String },
    #[error("Search not supported for site: {site}. Supported sites: {supported}")]
    UnsupportedSearchSite { site: String, supported: String },
    #[error("invalid locator {locator:?}: {message}")]
    InvalidLocator { locator: String, message: String },
    #[error("invalid adapter {name}: {message}")]
    InvalidAdapter { name: String, message: String },
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Title,
    Price,
    Stock,
    Seller,
    Data,
}

/// How raw element text becomes a field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostProcess {
    Text,
    Price,
    /// Text containing `out_of_stock` (case-insensitive) is OutOfStock, any other text InStock.
    StockPattern { out_of_stock: String },
    /// A non-empty element means InStock, a missing one OutOfStock.
    StockPresence,
    /// Text is present but says nothing about availability.
    StockOpaque,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Price { raw: String, numeric: Option<f64> },
    Stock(StockStatus),
}

impl PostProcess {
    pub fn apply(&self, text: Option<String>) -> Option<FieldValue> {
        match self {
            Self::Text => text.map(FieldValue::Text),
            Self::Price => text.map(|raw| FieldValue::Price {
                numeric: normalize_price(&raw),
                raw,
            }),
            Self::StockPattern { .. } | Self::StockPresence | Self::StockOpaque => {
                self.classify_stock(text.as_deref()).map(FieldValue::Stock)
            }
        }
    }

    pub fn classify_stock(&self, text: Option<&str>) -> Option<StockStatus> {
        match (self, text) {
            (Self::StockPattern { out_of_stock }, Some(text)) => {
                if text.to_lowercase().contains(&out_of_stock.to_lowercase()) {
                    Some(StockStatus::OutOfStock)
                } else {
                    Some(StockStatus::InStock)
                }
            }
            (Self::StockPresence, Some(_)) => Some(StockStatus::InStock),
            (Self::StockPresence, None) => Some(StockStatus::OutOfStock),
            (Self::StockOpaque, Some(_)) => Some(StockStatus::Unknown),
            _ => None,
        }
    }

    fn is_stock_rule(&self) -> bool {
        matches!(
            self,
            Self::StockPattern { .. } | Self::StockPresence | Self::StockOpaque
        )
    }
}

/// Strip everything but ASCII digits, `.` and `-`, then parse what is left.
pub fn normalize_price(raw: &str) -> Option<f64> {
    let cleaned = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect::<String>();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: FieldName,
    pub locator: String,
    #[serde(default = "default_post_process")]
    pub post_process: PostProcess,
}

fn default_post_process() -> PostProcess {
    PostProcess::Text
}

impl FieldSpec {
    pub fn new(field: FieldName, locator: impl Into<String>, post_process: PostProcess) -> Self {
        Self {
            field,
            locator: locator.into(),
            post_process,
        }
    }

    fn check(&self) -> Result<(), String> {
        let consistent = match self.field {
            FieldName::Title | FieldName::Seller | FieldName::Data => {
                self.post_process == PostProcess::Text
            }
            FieldName::Price => self.post_process == PostProcess::Price,
            FieldName::Stock => self.post_process.is_stock_rule(),
        };
        if !consistent {
            return Err(format!(
                "field {:?} cannot use post-process {:?}",
                self.field, self.post_process
            ));
        }
        Selector::parse(&self.locator)
            .map(|_| ())
            .map_err(|e| format!("locator {:?}: {e}", self.locator))
    }
}

/// Keyword search layout for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpec {
    /// Search page URL with a `{keyword}` placeholder.
    pub url_template: String,
    pub item: String,
    /// Title parts, joined with a space.
    pub title: Vec<String>,
    pub price: String,
    #[serde(default)]
    pub stock: Option<String>,
    #[serde(default = "default_search_stock")]
    pub stock_rule: PostProcess,
    pub link: String,
}

fn default_search_stock() -> PostProcess {
    PostProcess::StockOpaque
}

impl SearchSpec {
    pub fn search_url(&self, keyword: &str) -> String {
        self.url_template
            .replace("{keyword}", &urlencoding::encode(keyword))
    }
}

/// Declarative extraction strategy for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteAdapter {
    pub name: String,
    /// Substrings of the URL that select this adapter.
    pub hosts: Vec<String>,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub search: Option<SearchSpec>,
}

impl SiteAdapter {
    pub fn matches(&self, url: &str) -> bool {
        let url = url.to_ascii_lowercase();
        self.hosts
            .iter()
            .any(|host| url.contains(&host.to_ascii_lowercase()))
    }

    fn validate(&self) -> Result<(), AdapterError> {
        let invalid = |message: String| AdapterError::InvalidAdapter {
            name: self.name.clone(),
            message,
        };
        if self.name == DEFAULT_ADAPTER {
            return Err(invalid("the default adapter name is reserved".into()));
        }
        if self.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(invalid("at least one host pattern is required".into()));
        }
        if self.fields.is_empty() {
            return Err(invalid("at least one field is required".into()));
        }
        for field in &self.fields {
            field.check().map_err(invalid)?;
        }
        if let Some(search) = &self.search {
            if !search.url_template.contains("{keyword}") {
                return Err(invalid("search url_template needs a {keyword} placeholder".into()));
            }
            if !search.stock_rule.is_stock_rule() {
                return Err(invalid("search stock_rule must be a stock post-process".into()));
            }
        }
        Ok(())
    }
}

pub fn amazon_adapter() -> SiteAdapter {
    SiteAdapter {
        name: "amazon".into(),
        hosts: vec!["amazon.in".into(), "amazon.com".into()],
        fields: vec![
            FieldSpec::new(FieldName::Title, "#productTitle", PostProcess::Text),
            FieldSpec::new(FieldName::Price, ".a-price-whole", PostProcess::Price),
            FieldSpec::new(
                FieldName::Stock,
                "#availability span",
                PostProcess::StockPattern {
                    out_of_stock: "unavailable".into(),
                },
            ),
            FieldSpec::new(FieldName::Seller, "#sellerProfileTriggerId", PostProcess::Text),
        ],
        search: Some(SearchSpec {
            url_template: "https://www.amazon.in/s?k={keyword}".into(),
            item: ".s-result-item".into(),
            title: vec!["h2 a span".into()],
            price: ".a-price-whole".into(),
            stock: Some(".a-color-price".into()),
            stock_rule: PostProcess::StockPattern {
                out_of_stock: "unavailable".into(),
            },
            link: "h2 a".into(),
        }),
    }
}

pub fn flipkart_adapter() -> SiteAdapter {
    SiteAdapter {
        name: "flipkart".into(),
        hosts: vec!["flipkart.com".into()],
        fields: vec![
            FieldSpec::new(FieldName::Title, "h1.yhB1K5 span", PostProcess::Text),
            FieldSpec::new(FieldName::Price, "div._30jeq3._16Jk6d", PostProcess::Price),
            FieldSpec::new(
                FieldName::Stock,
                "div._16Jk6d",
                PostProcess::StockPattern {
                    out_of_stock: "out of stock".into(),
                },
            ),
            FieldSpec::new(FieldName::Seller, "div._1RLi3", PostProcess::Text),
        ],
        search: Some(SearchSpec {
            url_template: "https://www.flipkart.com/search?q={keyword}".into(),
            item: "div._1AtVbE".into(),
            title: vec!["div._4rR01T".into()],
            price: "div._30jeq3".into(),
            stock: Some("div.gUuXy-._16Jk6d".into()),
            stock_rule: PostProcess::StockPattern {
                out_of_stock: "out of stock".into(),
            },
            link: "a._1fQZEK".into(),
        }),
    }
}

pub fn myntra_adapter() -> SiteAdapter {
    SiteAdapter {
        name: "myntra".into(),
        hosts: vec!["myntra.com".into()],
        fields: vec![
            FieldSpec::new(FieldName::Title, ".pdp-title", PostProcess::Text),
            FieldSpec::new(
                FieldName::Price,
                ".pdp-price .pdp-discounted-price",
                PostProcess::Price,
            ),
            FieldSpec::new(
                FieldName::Stock,
                ".pdp-size-buttons",
                PostProcess::StockPattern {
                    out_of_stock: "out of stock".into(),
                },
            ),
            FieldSpec::new(FieldName::Seller, ".supplier-info a", PostProcess::Text),
        ],
        search: Some(SearchSpec {
            url_template: "https://www.myntra.com/{keyword}".into(),
            item: ".product-base".into(),
            title: vec![
                ".product-productMetaInfo .product-brand".into(),
                ".product-productMetaInfo .product-product".into(),
            ],
            price: ".product-price .product-discountedPrice".into(),
            stock: Some(".product-sizes".into()),
            stock_rule: PostProcess::StockPresence,
            link: "a".into(),
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SitesFile {
    #[serde(default)]
    sites: Vec<SiteAdapter>,
}

/// Everything needed to extract one URL: the resolved adapter and its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    pub adapter: String,
    pub url: String,
    pub fields: Vec<FieldSpec>,
}

/// Ordered adapter table; the first adapter whose host pattern occurs in the URL wins.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: Vec<SiteAdapter>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AdapterRegistry {
    pub fn builtin() -> Self {
        Self {
            adapters: vec![amazon_adapter(), flipkart_adapter(), myntra_adapter()],
        }
    }

    /// Built-in table with `extra` adapters consulted first.
    pub fn with_extra(extra: Vec<SiteAdapter>) -> Result<Self, AdapterError> {
        for adapter in &extra {
            adapter.validate()?;
        }
        let mut adapters = extra;
        adapters.extend(Self::builtin().adapters);
        Ok(Self { adapters })
    }

    pub fn parse_sites_yaml(text: &str) -> Result<Vec<SiteAdapter>> {
        let file: SitesFile = serde_yaml::from_str(text).context("parsing sites yaml")?;
        Ok(file.sites)
    }

    pub fn load_sites_file(path: impl AsRef<Path>) -> Result<Vec<SiteAdapter>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_sites_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn adapters(&self) -> &[SiteAdapter] {
        &self.adapters
    }

    pub fn resolve(&self, url: &str) -> Option<&SiteAdapter> {
        self.adapters.iter().find(|a| a.matches(url))
    }

    pub fn adapter_name(&self, url: &str) -> &str {
        self.resolve(url)
            .map(|a| a.name.as_str())
            .unwrap_or(DEFAULT_ADAPTER)
    }

    /// Resolve `url` to a plan. The default adapter needs `descriptor`; without one this
    /// fails before any page is opened.
    pub fn plan(&self, url: &str, descriptor: Option<&str>) -> Result<ExtractionPlan, AdapterError> {
        if let Some(adapter) = self.resolve(url) {
            return Ok(ExtractionPlan {
                adapter: adapter.name.clone(),
                url: url.to_string(),
                fields: adapter.fields.clone(),
            });
        }
        let descriptor = descriptor
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(AdapterError::DescriptorRequired)?;
        Ok(ExtractionPlan {
            adapter: DEFAULT_ADAPTER.to_string(),
            url: url.to_string(),
            fields: vec![FieldSpec::new(FieldName::Data, descriptor, PostProcess::Text)],
        })
    }

    pub fn search_sites(&self) -> Vec<&str> {
        self.adapters
            .iter()
            .filter(|a| a.search.is_some())
            .map(|a| a.name.as_str())
            .collect()
    }

    pub fn search_spec(&self, site: &str) -> Result<&SearchSpec, AdapterError> {
        self.adapters
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(site.trim()))
            .and_then(|a| a.search.as_ref())
            .ok_or_else(|| AdapterError::UnsupportedSearchSite {
                site: site.to_string(),
                supported: self.search_sites().join(", "),
            })
    }
}

/// Opens rendered pages. Implementations decide how a page is produced.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open(&self, url: &str, proxy: Option<&str>) -> Result<Box<dyn PageHandle>, RenderError>;
}

/// A rendered page. Lookups fail silently: a missing element is `None`.
#[async_trait]
pub trait PageHandle: Send + Sync {
    fn url(&self) -> &str;
    async fn text_of(&self, locator: &str) -> Option<String>;
    async fn source(&self) -> Result<String, RenderError>;
    async fn close(&mut self);
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(html: &str, locator: &str) -> Option<String> {
    let sel = Selector::parse(locator).ok()?;
    let document = Html::parse_document(html);
    let text = document.select(&sel).next().and_then(element_text);
    text
}

/// Parsed page held in memory; locators are CSS selectors.
#[derive(Debug, Clone)]
pub struct HtmlPage {
    url: String,
    html: String,
}

impl HtmlPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }
}

#[async_trait]
impl PageHandle for HtmlPage {
    fn url(&self) -> &str {
        &self.url
    }

    async fn text_of(&self, locator: &str) -> Option<String> {
        select_first_text(&self.html, locator)
    }

    async fn source(&self) -> Result<String, RenderError> {
        Ok(self.html.clone())
    }

    async fn close(&mut self) {}
}

/// Serves registered HTML by URL. Counts opens and closes.
#[derive(Debug, Default)]
pub struct StaticRenderer {
    pages: HashMap<String, String>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct CountedPage {
    inner: HtmlPage,
    closed: Arc<AtomicUsize>,
    released: bool,
}

#[async_trait]
impl PageHandle for CountedPage {
    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn text_of(&self, locator: &str) -> Option<String> {
        self.inner.text_of(locator).await
    }

    async fn source(&self) -> Result<String, RenderError> {
        self.inner.source().await
    }

    async fn close(&mut self) {
        if !self.released {
            self.released = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Renderer for StaticRenderer {
    async fn open(&self, url: &str, _proxy: Option<&str>) -> Result<Box<dyn PageHandle>, RenderError> {
        let html = self.pages.get(url).ok_or_else(|| RenderError::Navigation {
            url: url.to_string(),
            message: "no page registered for url".to_string(),
        })?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedPage {
            inner: HtmlPage::new(url, html.clone()),
            closed: self.closed.clone(),
            released: false,
        }))
    }
}

/// Fetches server-rendered HTML over HTTP; no script execution.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    fetcher: Arc<HttpFetcher>,
}

impl HttpRenderer {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn open(&self, url: &str, proxy: Option<&str>) -> Result<Box<dyn PageHandle>, RenderError> {
        let site = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .ok_or_else(|| RenderError::Navigation {
                url: url.to_string(),
                message: "url has no host".to_string(),
            })?;
        let response = self.fetcher.fetch_page(&site, url, proxy).await?;
        Ok(Box::new(HtmlPage::new(response.final_url.clone(), response.text())))
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverSettings {
    pub server_url: String,
    pub headless: bool,
    pub page_load_timeout: Duration,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:4444".to_string(),
            headless: true,
            page_load_timeout: Duration::from_secs(30),
        }
    }
}

/// One fresh Chrome session per page through a WebDriver endpoint.
#[derive(Debug, Clone)]
pub struct WebDriverRenderer {
    settings: WebDriverSettings,
}

impl WebDriverRenderer {
    pub fn new(settings: WebDriverSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Renderer for WebDriverRenderer {
    async fn open(&self, url: &str, proxy: Option<&str>) -> Result<Box<dyn PageHandle>, RenderError> {
        let mut caps = DesiredCapabilities::chrome();
        if self.settings.headless {
            caps.set_headless()?;
        }
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        if let Some(proxy) = proxy {
            caps.add_chrome_arg(&format!("--proxy-server={proxy}"))?;
        }

        let driver = WebDriver::new(&self.settings.server_url, caps).await?;
        if let Err(err) = driver
            .set_page_load_timeout(self.settings.page_load_timeout)
            .await
        {
            warn!(error = %err, "could not set page load timeout");
        }
        if let Err(err) = driver.goto(url).await {
            let _ = driver.quit().await;
            return Err(RenderError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            });
        }
        debug!(url, "browser page loaded");
        Ok(Box::new(WebDriverPage {
            url: url.to_string(),
            driver: Some(driver),
        }))
    }
}

struct WebDriverPage {
    url: String,
    driver: Option<WebDriver>,
}

#[async_trait]
impl PageHandle for WebDriverPage {
    fn url(&self) -> &str {
        &self.url
    }

    async fn text_of(&self, locator: &str) -> Option<String> {
        let driver = self.driver.as_ref()?;
        let element = driver.find(By::Css(locator)).await.ok()?;
        let text = element.text().await.ok()?;
        text_or_none(text)
    }

    async fn source(&self) -> Result<String, RenderError> {
        let driver = self.driver.as_ref().ok_or(RenderError::PoolClosed)?;
        Ok(driver.source().await?)
    }

    async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.quit().await {
                warn!(error = %err, "error closing browser session");
            }
        }
    }
}

impl Drop for WebDriverPage {
    fn drop(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = driver.quit().await {
                    warn!(error = %err, "error closing browser session during drop");
                }
            });
        }
    }
}

/// Extract every field of `plan` from `page`.
///
/// A field whose element is missing or empty is left absent; only a page on which
/// every field is absent is an error.
pub async fn extract(page: &dyn PageHandle, plan: &ExtractionPlan) -> Result<ExtractionRecord, AdapterError> {
    let mut record = ExtractionRecord::empty(plan.url.clone());
    for spec in &plan.fields {
        let text = page.text_of(&spec.locator).await;
        let Some(value) = spec.post_process.apply(text) else {
            debug!(adapter = %plan.adapter, field = ?spec.field, locator = %spec.locator, "field absent");
            continue;
        };
        assign_field(&mut record, spec.field, value);
    }

    if !record.has_any_field() {
        return Err(AdapterError::ExtractionFailed {
            url: plan.url.clone(),
        });
    }
    Ok(record)
}

fn assign_field(record: &mut ExtractionRecord, field: FieldName, value: FieldValue) {
    match (field, value) {
        (FieldName::Title, FieldValue::Text(text)) => record.title = Some(text),
        (FieldName::Seller, FieldValue::Text(text)) => record.seller = Some(text),
        (FieldName::Data, FieldValue::Text(text)) => record.data = Some(text),
        (FieldName::Price, FieldValue::Price { raw, numeric }) => {
            record.raw_price = Some(raw);
            record.numeric_price = numeric;
        }
        (FieldName::Stock, FieldValue::Stock(status)) => record.stock_status = Some(status),
        (field, value) => debug!(?field, ?value, "post-processed value does not fit field"),
    }
}

/// One product card from a search results page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub raw_price: String,
    pub numeric_price: Option<f64>,
    pub stock: Option<StockStatus>,
    pub url: Option<String>,
}

fn parse_selector(locator: &str) -> Result<Selector, AdapterError> {
    Selector::parse(locator).map_err(|e| AdapterError::InvalidLocator {
        locator: locator.to_string(),
        message: e.to_string(),
    })
}

fn first_text_within(item: ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector).next().and_then(element_text)
}

/// Parse up to [`SEARCH_RESULT_LIMIT`] result cards; cards without title or price are dropped.
pub fn parse_search_results(
    html: &str,
    page_url: &str,
    spec: &SearchSpec,
) -> Result<Vec<SearchHit>, AdapterError> {
    let item_sel = parse_selector(&spec.item)?;
    let title_sels = spec
        .title
        .iter()
        .map(|l| parse_selector(l))
        .collect::<Result<Vec<_>, _>>()?;
    let price_sel = parse_selector(&spec.price)?;
    let stock_sel = spec.stock.as_deref().map(parse_selector).transpose()?;
    let link_sel = parse_selector(&spec.link)?;
    let base = url::Url::parse(page_url).ok();

    let document = Html::parse_document(html);
    let hits = document
        .select(&item_sel)
        .take(SEARCH_RESULT_LIMIT)
        .filter_map(|item| {
            let title_parts = title_sels
                .iter()
                .filter_map(|sel| first_text_within(item, sel))
                .collect::<Vec<_>>();
            let title = text_or_none(title_parts.join(" "))?;
            let raw_price = first_text_within(item, &price_sel)?;
            let stock_text = stock_sel.as_ref().and_then(|sel| first_text_within(item, sel));
            let url = item
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| match &base {
                    Some(base) => base.join(href).ok().map(|u| u.to_string()),
                    None => Some(href.to_string()),
                });
            Some(SearchHit {
                numeric_price: normalize_price(&raw_price),
                stock: spec.stock_rule.classify_stock(stock_text.as_deref()),
                title,
                raw_price,
                url,
            })
        })
        .collect();
    Ok(hits)
}

/// Outbound proxy endpoints; one is picked at random per session.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    endpoints: Vec<String>,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn pick(&self) -> Option<String> {
        self.endpoints.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Bounded set of concurrent page sessions over one renderer.
///
/// Every page opened here is closed before the call returns, whatever the outcome.
#[derive(Clone)]
pub struct RenderPool {
    renderer: Arc<dyn Renderer>,
    sessions: Arc<Semaphore>,
    proxies: ProxyPool,
}

impl RenderPool {
    pub fn new(renderer: Arc<dyn Renderer>, max_sessions: usize, proxies: ProxyPool) -> Self {
        Self {
            renderer,
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
            proxies,
        }
    }

    async fn open(&self, url: &str) -> Result<Box<dyn PageHandle>, RenderError> {
        let proxy = self.proxies.pick();
        if let Some(proxy) = &proxy {
            info!(%proxy, url, "using proxy");
        }
        self.renderer.open(url, proxy.as_deref()).await
    }

    pub async fn extract(&self, plan: &ExtractionPlan) -> Result<ExtractionRecord, AdapterError> {
        let _session = self
            .sessions
            .acquire()
            .await
            .map_err(|_| RenderError::PoolClosed)?;
        let mut page = self.open(&plan.url).await?;
        let outcome = extract(page.as_ref(), plan).await;
        page.close().await;
        outcome
    }

    pub async fn search(&self, spec: &SearchSpec, keyword: &str) -> Result<Vec<SearchHit>, AdapterError> {
        let url = spec.search_url(keyword);
        let _session = self
            .sessions
            .acquire()
            .await
            .map_err(|_| RenderError::PoolClosed)?;
        let mut page = self.open(&url).await?;
        let source = page.source().await;
        let page_url = page.url().to_string();
        page.close().await;
        parse_search_results(&source?, &page_url, spec)
    }
}
