use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fetch::{PageProvider, ProviderError};
use crate::parser::{Extract, ExtractError, Item};

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub max_pages: u32,
    /// Bound on every single provider call.
    pub timeout: Duration,
    /// Pause before every fetch after the first.
    pub delay: Duration,
    /// Extra random pause in `[0, jitter]` added to `delay`.
    pub jitter: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxPagesZero,
    NoNewItems,
    MaxPages,
    LastPage,
    ProviderError,
}

/// A page that could not be turned into items.
#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("page content not understood: {0}")]
    Format(#[from] ExtractError),
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("first page failed: {0}")]
    FirstPage(PageError),
}

#[derive(Debug)]
pub struct CrawlOutcome {
    pub items: Vec<Item>,
    pub pages_crawled: u32,
    pub stop_reason: StopReason,
    /// Why a partial crawl ended early.
    pub error: Option<String>,
}

/// Accumulated state of one crawl. Items stay in first-seen order and
/// `seen_ids` always holds exactly their identity keys.
pub struct CrawlSession {
    seen_ids: HashSet<String>,
    items: Vec<Item>,
    page_count: u32,
    max_pages: u32,
}

impl CrawlSession {
    pub fn new(max_pages: u32) -> Self {
        CrawlSession {
            seen_ids: HashSet::new(),
            items: Vec::new(),
            page_count: 0,
            max_pages,
        }
    }

    /// Merge one page's items, returning how many were new.
    pub fn absorb(&mut self, page: Vec<Item>) -> usize {
        self.page_count += 1;
        let before = self.items.len();
        for item in page {
            if !item.is_meaningful() {
                continue;
            }
            if self.seen_ids.insert(item.identity_key()) {
                self.items.push(item);
            }
        }
        self.items.len() - before
    }

    pub fn collected(&self) -> usize {
        self.items.len()
    }

    fn at_limit(&self) -> bool {
        self.page_count >= self.max_pages
    }

    fn finish(self, stop_reason: StopReason, error: Option<String>) -> CrawlOutcome {
        debug_assert_eq!(self.seen_ids.len(), self.items.len());
        CrawlOutcome {
            items: self.items,
            pages_crawled: self.page_count,
            stop_reason,
            error,
        }
    }
}

/// Walk the listing page by page until a stop condition holds.
///
/// A failure on the first page fails the crawl; a failure later ends it
/// with what was collected so far.
pub async fn crawl<P: PageProvider, E: Extract>(
    provider: &mut P,
    extractor: &E,
    url: &str,
    opts: &CrawlOptions,
) -> Result<CrawlOutcome, CrawlError> {
    let mut session = CrawlSession::new(opts.max_pages);
    if opts.max_pages == 0 {
        info!("max_pages is 0, nothing to crawl");
        return Ok(session.finish(StopReason::MaxPagesZero, None));
    }

    let pb = ProgressBar::new(opts.max_pages as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:30} page {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let mut page = 1u32;
    let (stop_reason, error) = loop {
        if page > 1 {
            politeness_delay(opts).await;
        }

        let items = match fetch_page(provider, extractor, url, opts.timeout).await {
            Ok(items) => items,
            Err(e) if page == 1 => {
                pb.finish_and_clear();
                return Err(CrawlError::FirstPage(e));
            }
            Err(e) => {
                warn!("Page {} failed, keeping {} items: {}", page, session.collected(), e);
                break (StopReason::ProviderError, Some(e.to_string()));
            }
        };

        let new_count = session.absorb(items);
        pb.inc(1);
        pb.set_message(format!("{} items", session.collected()));
        info!("Page {}: {} new items ({} total)", page, new_count, session.collected());

        if new_count == 0 && page > 1 {
            break (StopReason::NoNewItems, None);
        }
        if session.at_limit() {
            break (StopReason::MaxPages, None);
        }

        match bounded(opts.timeout, provider.advance_page()).await {
            Ok(true) => page += 1,
            Ok(false) => {
                debug!(page, "last page reached");
                break (StopReason::LastPage, None);
            }
            Err(e) => {
                warn!("Could not move past page {}: {}", page, e);
                break (StopReason::ProviderError, Some(e.to_string()));
            }
        }
    };

    pb.finish_and_clear();
    Ok(session.finish(stop_reason, error))
}

async fn fetch_page<P: PageProvider, E: Extract>(
    provider: &mut P,
    extractor: &E,
    url: &str,
    timeout: Duration,
) -> Result<Vec<Item>, PageError> {
    let content = bounded(timeout, provider.fetch(url)).await?;
    Ok(extractor.extract(&content)?)
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ProviderError::Timeout(limit))?
}

/// Fixed delay plus a uniform jitter in `0..=jitter`.
fn pause_for(opts: &CrawlOptions) -> Duration {
    let jitter_ms = u64::try_from(opts.jitter.as_millis()).unwrap_or(u64::MAX);
    let extra = if jitter_ms == 0 {
        0
    } else {
        fastrand::u64(0..=jitter_ms)
    };
    opts.delay + Duration::from_millis(extra)
}

async fn politeness_delay(opts: &CrawlOptions) {
    let pause = pause_for(opts);
    if !pause.is_zero() {
        debug!("Sleeping {:.2}s before next page", pause.as_secs_f64());
        tokio::time::sleep(pause).await;
    }
}
