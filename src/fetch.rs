use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use thiserror::Error;
use tracing::{debug, warn};

use crate::parser::strategy::{compile_selector, text_of};
use crate::parser::ExtractError;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid listing URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("provider setup failed: {0}")]
    Setup(String),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("render failed: {0}")]
    Render(String),
    #[error("cannot read page file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Whether another attempt at the same page might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Status { status, .. } => matches!(*status, 429 | 500 | 502 | 503 | 504),
            ProviderError::Http { source, .. } => source.is_timeout() || source.is_connect(),
            ProviderError::Render(msg) => msg.contains("429") || msg.contains("rate"),
            _ => false,
        }
    }
}

/// Retries for transient failures, with the backoff doubling each time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Runs `op` again after transient failures, up to `max_retries` times.
pub async fn with_retry<F, Fut>(
    policy: &RetryPolicy,
    url: &str,
    mut op: F,
) -> Result<String, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Rate limited on {} (attempt {}/{}), backing off {:.1}s: {}",
                    url,
                    attempt + 1,
                    policy.max_retries,
                    backoff.as_secs_f64(),
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Renders pages of one listing and moves between them. `fetch` returns
/// the current page; `advance_page` moves to the next one and reports
/// `false` when there is none.
#[allow(async_fn_in_trait)]
pub trait PageProvider {
    async fn fetch(&mut self, url: &str) -> Result<String, ProviderError>;
    async fn advance_page(&mut self) -> Result<bool, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Plain HTTP GET
    Http,
    /// JavaScript rendering through spider.cloud
    Spider,
    /// Saved pages from a directory
    Dir,
}

/// Only absolute http(s) URLs are accepted as listings.
pub fn parse_listing_url(url: &str) -> Result<Url, ProviderError> {
    let invalid = |reason: String| ProviderError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url.trim()).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err(invalid("missing host".into())),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

/// Where to look for pagination in a rendered page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationSpec {
    /// Page number links; one whose text is the next number means there is a next page.
    pub number_links: Vec<String>,
    /// Dedicated "next" controls.
    pub next_controls: Vec<String>,
    /// Links or buttons with exactly this text also count as "next".
    pub next_labels: Vec<String>,
    /// Controls carrying one of these classes are disabled.
    pub disabled_classes: Vec<String>,
}

impl Default for PaginationSpec {
    fn default() -> Self {
        PaginationSpec {
            number_links: vec![
                "div.LiT9lKOVbw a".into(),
                "div.L2CTE05CX2 a".into(),
                "[class*='pagination'] a".into(),
            ],
            next_controls: vec![
                "a[rel='next']".into(),
                "link[rel='next']".into(),
                "a[aria-label='다음']".into(),
                "a[aria-label='Next']".into(),
            ],
            next_labels: vec!["다음".into(), "Next".into()],
            disabled_classes: vec!["jKodyicQKc".into(), "disabled".into()],
        }
    }
}

const JSON_TOTAL_KEYS: &[&str] = &["totalPages", "totalPage", "pageCount"];
const JSON_ITEM_KEYS: &[&str] = &["contents", "reviews", "data"];

/// Page cursor shared by the network providers. Page 1 is the listing URL
/// as given; later pages carry the page number in `page_param`.
pub struct Pager {
    page: u32,
    page_param: String,
    number_links: Vec<Selector>,
    next_controls: Vec<Selector>,
    next_labels: Vec<String>,
    disabled_classes: Vec<String>,
    labelled: Selector,
    last: Option<String>,
}

impl Pager {
    pub fn new(page_param: &str, spec: &PaginationSpec) -> Result<Self, ExtractError> {
        let compile = |list: &[String]| -> Result<Vec<Selector>, ExtractError> {
            list.iter().map(|s| compile_selector(s)).collect()
        };
        Ok(Pager {
            page: 1,
            page_param: page_param.to_string(),
            number_links: compile(&spec.number_links)?,
            next_controls: compile(&spec.next_controls)?,
            next_labels: spec.next_labels.clone(),
            disabled_classes: spec.disabled_classes.clone(),
            labelled: compile_selector("a, button")?,
            last: None,
        })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_url(&self, listing: &str) -> Result<String, ProviderError> {
        let mut url = parse_listing_url(listing)?;
        if self.page > 1 {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != self.page_param.as_str())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept)
                .append_pair(&self.page_param, &self.page.to_string());
        }
        Ok(url.into())
    }

    fn record(&mut self, content: &str) {
        self.last = Some(content.to_string());
    }

    /// Whether the last fetched page links to page `page + 1`.
    pub fn has_next(&self) -> bool {
        let Some(last) = &self.last else {
            return false;
        };
        let trimmed = last.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return self.json_has_next(&value);
            }
        }
        let doc = Html::parse_document(last);
        let wanted = (self.page + 1).to_string();

        let numbered = self
            .number_links
            .iter()
            .flat_map(|sel| doc.select(sel))
            .any(|el| !self.is_disabled(el) && text_of(el, &[]) == wanted);
        if numbered {
            return true;
        }

        let control = self
            .next_controls
            .iter()
            .flat_map(|sel| doc.select(sel))
            .any(|el| !self.is_disabled(el));
        if control {
            return true;
        }

        doc.select(&self.labelled).any(|el| {
            !self.is_disabled(el) && {
                let text = text_of(el, &[]);
                self.next_labels.iter().any(|l| *l == text)
            }
        })
    }

    /// API pages: paging fields win when present, otherwise a non-empty
    /// item list means the next page is worth asking for.
    fn json_has_next(&self, value: &Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        let flag = |key: &str| obj.get(key).and_then(Value::as_bool);
        if let Some(last) = flag("last").or_else(|| flag("isLast")) {
            return !last;
        }
        if let Some(more) = flag("hasNext").or_else(|| flag("hasNextPage")) {
            return more;
        }
        let total = JSON_TOTAL_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_u64));
        if let Some(total) = total {
            return u64::from(self.page) < total;
        }
        JSON_ITEM_KEYS.iter().any(|k| {
            obj.get(*k)
                .and_then(Value::as_array)
                .is_some_and(|items| !items.is_empty())
        })
    }

    fn is_disabled(&self, el: ElementRef) -> bool {
        let v = el.value();
        v.attr("disabled").is_some()
            || v.attr("aria-disabled") == Some("true")
            || v.classes().any(|c| self.disabled_classes.iter().any(|d| d == c))
    }

    /// Move to the next page if the last one linked to it.
    fn advance(&mut self) -> bool {
        if !self.has_next() {
            debug!(page = self.page, "no next page control");
            return false;
        }
        self.page += 1;
        self.last = None;
        true
    }
}

pub struct HttpProvider {
    client: reqwest::Client,
    pager: Pager,
    retry: RetryPolicy,
}

impl HttpProvider {
    pub fn new(user_agent: &str, pager: Pager, retry: RetryPolicy) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProviderError::Setup(e.to_string()))?;
        Ok(HttpProvider {
            client,
            pager,
            retry,
        })
    }
}

async fn http_get(client: &reqwest::Client, url: &str) -> Result<String, ProviderError> {
    let http = |source| ProviderError::Http {
        url: url.to_string(),
        source,
    };
    let resp = client
        .get(url)
        .header(ACCEPT, "text/html,application/json;q=0.9,*/*;q=0.8")
        .header(ACCEPT_LANGUAGE, "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7")
        .send()
        .await
        .map_err(http)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ProviderError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    resp.text().await.map_err(http)
}

impl PageProvider for HttpProvider {
    async fn fetch(&mut self, listing: &str) -> Result<String, ProviderError> {
        let url = self.pager.page_url(listing)?;
        debug!(%url, page = self.pager.page(), "GET");
        let client = &self.client;
        let body = with_retry(&self.retry, &url, || http_get(client, &url)).await?;
        self.pager.record(&body);
        Ok(body)
    }

    async fn advance_page(&mut self) -> Result<bool, ProviderError> {
        Ok(self.pager.advance())
    }
}

pub struct SpiderProvider {
    spider: Spider,
    pager: Pager,
    retry: RetryPolicy,
}

impl SpiderProvider {
    /// Needs `SPIDER_API_KEY` in the environment.
    pub fn from_env(pager: Pager, retry: RetryPolicy) -> Result<Self, ProviderError> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| ProviderError::Setup("SPIDER_API_KEY environment variable must be set".into()))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| ProviderError::Setup(format!("failed to create Spider client: {}", e)))?;
        Ok(SpiderProvider {
            spider,
            pager,
            retry,
        })
    }
}

async fn spider_render(spider: &Spider, url: &str) -> Result<String, ProviderError> {
    let params = RequestParams {
        return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
        ..Default::default()
    };
    let response = spider
        .scrape_url(url, Some(params), "application/json")
        .await
        .map_err(|e| ProviderError::Render(e.to_string()))?;

    let parsed: Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };
    let first = parsed.as_array().and_then(|arr| arr.first());

    if let Some(status) = first.and_then(|obj| obj.get("status")).and_then(|s| s.as_u64()) {
        if !(200..300).contains(&status) {
            return Err(ProviderError::Status {
                url: url.to_string(),
                status: status as u16,
            });
        }
    }
    first
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Render(format!("no content in spider response for {}", url)))
}

impl PageProvider for SpiderProvider {
    async fn fetch(&mut self, listing: &str) -> Result<String, ProviderError> {
        let url = self.pager.page_url(listing)?;
        debug!(%url, page = self.pager.page(), "render");
        let spider = &self.spider;
        let content = with_retry(&self.retry, &url, || spider_render(spider, &url)).await?;
        self.pager.record(&content);
        Ok(content)
    }

    async fn advance_page(&mut self) -> Result<bool, ProviderError> {
        Ok(self.pager.advance())
    }
}

/// Replays `page-1.html`, `page-2.html`, ... (or `.json`) from a directory.
/// The listing URL is not consulted.
pub struct DirProvider {
    dir: PathBuf,
    page: u32,
}

impl DirProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirProvider {
            dir: dir.into(),
            page: 1,
        }
    }

    fn page_file(&self, page: u32) -> Option<PathBuf> {
        ["html", "json"]
            .iter()
            .map(|ext| self.dir.join(format!("page-{}.{}", page, ext)))
            .find(|p| p.is_file())
    }
}

impl PageProvider for DirProvider {
    async fn fetch(&mut self, _listing: &str) -> Result<String, ProviderError> {
        let path = self
            .page_file(self.page)
            .unwrap_or_else(|| self.dir.join(format!("page-{}.html", self.page)));
        debug!(path = %path.display(), "read page");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ProviderError::Io { path, source })
    }

    async fn advance_page(&mut self) -> Result<bool, ProviderError> {
        if self.page_file(self.page + 1).is_none() {
            return Ok(false);
        }
        self.page += 1;
        Ok(true)
    }
}

/// One of the concrete providers, picked at runtime.
pub enum AnyProvider {
    Http(HttpProvider),
    Spider(SpiderProvider),
    Dir(DirProvider),
}

impl AnyProvider {
    pub fn build(
        kind: ProviderKind,
        from_dir: Option<&Path>,
        user_agent: &str,
        pager: Pager,
        retry: RetryPolicy,
    ) -> Result<Self, ProviderError> {
        Ok(match kind {
            ProviderKind::Http => AnyProvider::Http(HttpProvider::new(user_agent, pager, retry)?),
            ProviderKind::Spider => AnyProvider::Spider(SpiderProvider::from_env(pager, retry)?),
            ProviderKind::Dir => {
                let dir = from_dir
                    .ok_or_else(|| ProviderError::Setup("--provider dir needs --from-dir".into()))?;
                if !dir.is_dir() {
                    return Err(ProviderError::Setup(format!(
                        "{} is not a directory",
                        dir.display()
                    )));
                }
                AnyProvider::Dir(DirProvider::new(dir))
            }
        })
    }
}

impl PageProvider for AnyProvider {
    async fn fetch(&mut self, url: &str) -> Result<String, ProviderError> {
        match self {
            AnyProvider::Http(p) => p.fetch(url).await,
            AnyProvider::Spider(p) => p.fetch(url).await,
            AnyProvider::Dir(p) => p.fetch(url).await,
        }
    }

    async fn advance_page(&mut self) -> Result<bool, ProviderError> {
        match self {
            AnyProvider::Http(p) => p.advance_page().await,
            AnyProvider::Spider(p) => p.advance_page().await,
            AnyProvider::Dir(p) => p.advance_page().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "https://smartstore.naver.com/shop/products/123?tab=review";

    fn pager() -> Pager {
        Pager::new("page", &PaginationSpec::default()).unwrap()
    }

    #[test]
    fn listing_urls_must_be_http() {
        assert!(parse_listing_url(LISTING).is_ok());
        assert!(parse_listing_url("ftp://example.com/x").is_err());
        assert!(parse_listing_url("not a url").is_err());
        assert!(parse_listing_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn page_number_goes_in_query() {
        let mut p = pager();
        assert_eq!(p.page_url(LISTING).unwrap(), LISTING);

        p.page = 2;
        assert_eq!(
            p.page_url(LISTING).unwrap(),
            "https://smartstore.naver.com/shop/products/123?tab=review&page=2"
        );
        p.page = 3;
        assert_eq!(
            p.page_url("https://example.com/r?page=2&sort=new").unwrap(),
            "https://example.com/r?sort=new&page=3"
        );
    }

    #[test]
    fn next_number_link_counts() {
        let mut p = pager();
        assert!(!p.has_next(), "nothing fetched yet");
        p.record(&std::fs::read_to_string("tests/fixtures/review_page.html").unwrap());
        assert!(p.has_next());
        assert!(p.advance());
        assert_eq!(p.page(), 2);
    }

    #[test]
    fn disabled_next_is_last_page() {
        let mut p = pager();
        p.page = 4;
        p.record(
            r#"<div class="LiT9lKOVbw"><a>3</a><a aria-current="true">4</a>
               <a class="jKodyicQKc"><span>다음</span></a></div>"#,
        );
        assert!(!p.has_next());
        assert!(!p.advance());
        assert_eq!(p.page(), 4);
    }

    #[test]
    fn rel_next_and_labels() {
        let mut p = pager();
        p.record(r#"<html><head><link rel="next" href="?page=2"></head></html>"#);
        assert!(p.has_next());

        p.record(r#"<nav><button type="button">Next</button></nav>"#);
        assert!(p.has_next());

        p.record(r#"<nav><button type="button" disabled>Next</button></nav>"#);
        assert!(!p.has_next());
    }

    #[test]
    fn api_pages_use_paging_fields() {
        let mut p = pager();
        p.record(r#"{"contents": [{"id": 1}], "page": 1, "size": 20, "totalPages": 6}"#);
        assert!(p.has_next());
        assert!(p.advance());
        assert_eq!(p.page(), 2);

        p.page = 6;
        p.record(r#"{"contents": [{"id": 9}], "page": 6, "totalPages": 6}"#);
        assert!(!p.has_next());

        p.page = 1;
        p.record(r#"{"reviews": [{"reviewId": 1}], "last": true, "totalPages": 4}"#);
        assert!(!p.has_next());
        p.record(r#"{"data": [], "hasNext": true}"#);
        assert!(p.has_next());
    }

    #[test]
    fn api_pages_without_paging_fields_follow_the_list() {
        let mut p = pager();
        p.record(r#"{"reviews": [{"reviewId": 1}, {"reviewId": 2}]}"#);
        assert!(p.has_next());
        p.record(r#"  {"reviews": []}"#);
        assert!(!p.has_next());
        p.record(r#"{"result": "ok"}"#);
        assert!(!p.has_next());
        p.record("[1, 2]");
        assert!(!p.has_next());
    }

    #[test]
    fn transient_errors() {
        let status = |status| ProviderError::Status {
            url: LISTING.into(),
            status,
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
        assert!(ProviderError::Render("HTTP 429 Too Many Requests".into()).is_transient());
        assert!(!ProviderError::Render("no content".into()).is_transient());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_transient());
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_until_the_rate_limit_clears() {
        let mut calls = 0;
        let body = with_retry(&quick_retry(), LISTING, || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(ProviderError::Status {
                        url: LISTING.into(),
                        status: 429,
                    })
                } else {
                    Ok("<html>page</html>".to_string())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(body, "<html>page</html>");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let mut calls = 0;
        let err = with_retry(&quick_retry(), LISTING, || {
            calls += 1;
            async {
                Err(ProviderError::Status {
                    url: LISTING.into(),
                    status: 502,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Status { status: 502, .. }));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let err = with_retry(&quick_retry(), LISTING, || {
            calls += 1;
            async {
                Err(ProviderError::Status {
                    url: LISTING.into(),
                    status: 404,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Status { status: 404, .. }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_doubles() {
        let r = RetryPolicy::default();
        assert_eq!(r.backoff(0), Duration::from_secs(2));
        assert_eq!(r.backoff(2), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn dir_provider_replays_numbered_pages() {
        let mut p = DirProvider::new("tests/fixtures/pages");
        let first = p.fetch(LISTING).await.unwrap();
        assert!(first.contains("p1-a"));
        assert!(p.advance_page().await.unwrap());
        let second = p.fetch(LISTING).await.unwrap();
        assert!(second.contains("p2-a"));
        assert!(!p.advance_page().await.unwrap());
    }

    #[tokio::test]
    async fn dir_provider_missing_page_is_error() {
        let mut p = DirProvider::new("tests/fixtures/no-such-dir");
        let err = p.fetch(LISTING).await.unwrap_err();
        assert!(matches!(err, ProviderError::Io { .. }));
    }

    #[test]
    fn dir_provider_needs_directory() {
        let err = AnyProvider::build(ProviderKind::Dir, None, "ua", pager(), RetryPolicy::default())
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Setup(_)));
    }
}
