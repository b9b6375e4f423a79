use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::crawler::CrawlOptions;
use crate::fetch::{PaginationSpec, RetryPolicy};
use crate::parser::html::HtmlProfileSpec;
use crate::parser::Profile;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Runtime settings: built-in defaults, then `review_harvester.toml` (or
/// the `--config` file), then `HARVEST_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Value of the `source` column for saved rows.
    pub source_label: String,
    pub max_pages: u32,
    pub timeout_secs: u64,
    pub delay_ms: u64,
    pub jitter_ms: u64,
    /// Extra attempts for a page after a rate limit or server error.
    pub retries: u32,
    pub backoff_ms: u64,
    pub user_agent: String,
    /// Query parameter that carries the page number.
    pub page_param: String,
    #[serde(default)]
    pub pagination: PaginationSpec,
    /// Replaces the built-in review selectors.
    #[serde(default)]
    pub review: Option<HtmlProfileSpec>,
    /// Replaces the built-in Q&A selectors.
    #[serde(default)]
    pub qna: Option<HtmlProfileSpec>,
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("db_path", "data/reviews.sqlite")?
            .set_default("source_label", "Naver SmartStore")?
            .set_default("max_pages", 3i64)?
            .set_default("timeout_secs", 30i64)?
            .set_default("delay_ms", 500i64)?
            .set_default("jitter_ms", 1000i64)?
            .set_default("retries", 3i64)?
            .set_default("backoff_ms", 2000i64)?
            .set_default("user_agent", DEFAULT_USER_AGENT)?
            .set_default("page_param", "page")?;

        let builder = match file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("review_harvester").required(false)),
        };

        builder
            .add_source(Environment::with_prefix("HARVEST").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn profile_override(&self, profile: Profile) -> Option<&HtmlProfileSpec> {
        match profile {
            Profile::Review => self.review.as_ref(),
            Profile::Qna => self.qna.as_ref(),
            Profile::Api => None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retries,
            base_backoff: Duration::from_millis(self.backoff_ms),
        }
    }

    /// Crawl options with command-line overrides applied.
    pub fn crawl_options(
        &self,
        max_pages: Option<u32>,
        timeout_secs: Option<u64>,
        delay_ms: Option<u64>,
    ) -> CrawlOptions {
        CrawlOptions {
            max_pages: max_pages.unwrap_or(self.max_pages),
            timeout: Duration::from_secs(timeout_secs.unwrap_or(self.timeout_secs)),
            delay: Duration::from_millis(delay_ms.unwrap_or(self.delay_ms)),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::strategy::FieldStrategy;

    #[test]
    fn defaults_then_env() {
        let s = Settings::load(None).unwrap();
        assert_eq!(s.db_path, PathBuf::from("data/reviews.sqlite"));
        assert_eq!(s.source_label, "Naver SmartStore");
        assert_eq!(s.max_pages, 3);
        assert_eq!(s.page_param, "page");
        assert_eq!(s.pagination, PaginationSpec::default());
        assert!(s.review.is_none());
        assert_eq!(s.retry_policy(), RetryPolicy::default());

        std::env::set_var("HARVEST_MAX_PAGES", "7");
        std::env::set_var("HARVEST_DB_PATH", "/tmp/other.sqlite");
        let s = Settings::load(None);
        std::env::remove_var("HARVEST_MAX_PAGES");
        std::env::remove_var("HARVEST_DB_PATH");
        let s = s.unwrap();
        assert_eq!(s.max_pages, 7);
        assert_eq!(s.db_path, PathBuf::from("/tmp/other.sqlite"));
    }

    #[test]
    fn file_overrides_profiles() {
        let s = Settings::load(Some(Path::new("tests/fixtures/settings.toml"))).unwrap();
        assert_eq!(s.delay_ms, 0);
        assert_eq!(s.source_label, "Test Shop");
        assert_eq!(
            s.retry_policy(),
            RetryPolicy {
                max_retries: 1,
                base_backoff: Duration::from_millis(50),
            }
        );

        let review = s.profile_override(Profile::Review).unwrap();
        assert_eq!(review.items, vec!["div.review".to_string()]);
        assert_eq!(review.body, vec![FieldStrategy::text("p.body")]);
        assert!(s.profile_override(Profile::Qna).is_none());
        assert!(s.profile_override(Profile::Api).is_none());
        assert_eq!(s.pagination.next_labels, vec!["more".to_string()]);
    }

    #[test]
    fn missing_explicit_file_is_error() {
        assert!(Settings::load(Some(Path::new("tests/fixtures/nope.toml"))).is_err());
    }

    #[test]
    fn cli_values_win() {
        let s = Settings::load(Some(Path::new("tests/fixtures/settings.toml"))).unwrap();
        let o = s.crawl_options(Some(9), None, Some(250));
        assert_eq!(o.max_pages, 9);
        assert_eq!(o.timeout, Duration::from_secs(s.timeout_secs));
        assert_eq!(o.delay, Duration::from_millis(250));

        let o = s.crawl_options(None, Some(2), None);
        assert_eq!(o.max_pages, s.max_pages);
        assert_eq!(o.timeout, Duration::from_secs(2));
    }
}
