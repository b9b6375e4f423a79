use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::normalize::clean_media_refs;
use super::strategy::{compile_selector, media_urls, FieldRule, FieldStrategy, MediaStrategy};
use super::{Extract, ExtractError, Item, ANONYMOUS};

static RATING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

const DATE_PATTERN: &str = r"(\d{2,4}\.\d{1,2}\.\d{1,2})\.?";

/// Selector profile for one kind of HTML list page. Every field is an
/// ordered strategy list; `items` is an ordered list of container
/// selectors where the first one matching anything is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlProfileSpec {
    pub items: Vec<String>,
    /// Containers lacking this element are skipped (e.g. seller-reply-only rows).
    #[serde(default)]
    pub require: Option<String>,
    #[serde(default)]
    pub external_id: Vec<FieldStrategy>,
    #[serde(default)]
    pub author: Vec<FieldStrategy>,
    #[serde(default)]
    pub date: Vec<FieldStrategy>,
    #[serde(default)]
    pub rating: Vec<FieldStrategy>,
    #[serde(default)]
    pub body: Vec<FieldStrategy>,
    #[serde(default)]
    pub option_text: Vec<FieldStrategy>,
    #[serde(default)]
    pub answer: Vec<FieldStrategy>,
    #[serde(default)]
    pub status: Vec<FieldStrategy>,
    #[serde(default)]
    pub media: Vec<MediaStrategy>,
    /// Only media URLs containing this host are kept.
    #[serde(default)]
    pub media_host: Option<String>,
}

impl HtmlProfileSpec {
    /// Storefront review list.
    pub fn review() -> Self {
        HtmlProfileSpec {
            items: vec![
                r#"li[data-shp-contents-type="review"]"#.into(),
                "ul.RR2FSL9wTc > li.PxsZltB5tV".into(),
                "div.HTT4L8U0CU ul.RR2FSL9wTc > li".into(),
            ],
            require: Some("div.AlfkEF45qI".into()),
            external_id: vec![FieldStrategy::own_attr("data-shp-contents-id")],
            author: vec![
                FieldStrategy::text("div.Db9Dtnf7gY strong.MX91DFZo2F"),
                FieldStrategy::text("strong[class*='name']"),
            ],
            date: vec![
                FieldStrategy::pattern(DATE_PATTERN, Some("div.Db9Dtnf7gY")),
                FieldStrategy::pattern(DATE_PATTERN, None),
            ],
            rating: vec![
                FieldStrategy::text("em.n6zq2yy0KA"),
                FieldStrategy::pattern(r"평점\s*([1-5])", None),
            ],
            body: vec![
                FieldStrategy::Text {
                    selector: "div.AlfkEF45qI div.HakaEZ240l div.KqJ8Qqw082 span.MX91DFZo2F".into(),
                    longest: true,
                    exclude_classes: vec!["rnrf6Xo7x2".into(), "W1IZsaUmnu".into()],
                },
                FieldStrategy::Text {
                    selector: "div.KqJ8Qqw082".into(),
                    longest: true,
                    exclude_classes: vec!["rnrf6Xo7x2".into(), "W1IZsaUmnu".into()],
                },
            ],
            option_text: vec![FieldStrategy::Text {
                selector: "div.b_caIle8kC".into(),
                longest: false,
                exclude_classes: vec!["eWRrdDdSzW".into(), "RVbIFwX5dY".into()],
            }],
            answer: Vec::new(),
            status: Vec::new(),
            media: vec![MediaStrategy {
                selector: "div.s30AvhHfb0 img.UpImHAUeYJ".into(),
                attrs: vec!["data-src".into(), "src".into()],
            }],
            media_host: Some("pstatic.net".into()),
        }
    }

    /// Storefront Q&A list; the question becomes the item body.
    pub fn qna() -> Self {
        HtmlProfileSpec {
            items: vec![
                "ul[class*='question'] > li".into(),
                "ul[class*='qna'] > li".into(),
            ],
            require: None,
            external_id: vec![
                FieldStrategy::own_attr("data-shp-contents-id"),
                FieldStrategy::own_attr("data-qna-id"),
            ],
            author: vec![
                FieldStrategy::text("span[class*='author']"),
                FieldStrategy::text("span[class*='writer']"),
            ],
            date: vec![
                FieldStrategy::text("span[class*='date']"),
                FieldStrategy::pattern(DATE_PATTERN, None),
            ],
            rating: Vec::new(),
            body: vec![
                FieldStrategy::text("strong"),
                FieldStrategy::text("div[class*='title']"),
            ],
            option_text: Vec::new(),
            answer: vec![FieldStrategy::text("div[class*='answer']")],
            status: vec![FieldStrategy::text("span[class*='status']")],
            media: Vec::new(),
            media_host: None,
        }
    }
}

pub struct HtmlExtractor {
    items: Vec<Selector>,
    require: Option<Selector>,
    external_id: FieldRule,
    author: FieldRule,
    date: FieldRule,
    rating: FieldRule,
    body: FieldRule,
    option_text: FieldRule,
    answer: FieldRule,
    status: FieldRule,
    media: Vec<(Selector, Vec<String>)>,
    media_host: Option<String>,
}

impl HtmlExtractor {
    pub fn new(spec: &HtmlProfileSpec) -> Result<Self, ExtractError> {
        if spec.items.is_empty() {
            return Err(ExtractError::NoContainers);
        }
        Ok(HtmlExtractor {
            items: spec
                .items
                .iter()
                .map(|s| compile_selector(s))
                .collect::<Result<_, _>>()?,
            require: spec.require.as_deref().map(compile_selector).transpose()?,
            external_id: FieldRule::compile(&spec.external_id)?,
            author: FieldRule::compile(&spec.author)?,
            date: FieldRule::compile(&spec.date)?,
            rating: FieldRule::compile(&spec.rating)?,
            body: FieldRule::compile(&spec.body)?,
            option_text: FieldRule::compile(&spec.option_text)?,
            answer: FieldRule::compile(&spec.answer)?,
            status: FieldRule::compile(&spec.status)?,
            media: spec
                .media
                .iter()
                .map(MediaStrategy::compile)
                .collect::<Result<_, _>>()?,
            media_host: spec.media_host.clone(),
        })
    }

    fn item_from(&self, el: ElementRef) -> Option<Item> {
        if let Some(required) = &self.require {
            el.select(required).next()?;
        }

        let item = Item {
            external_id: self.external_id.first(el),
            author: self.author.first(el).unwrap_or_else(|| ANONYMOUS.to_string()),
            body: self.body.first(el).unwrap_or_default(),
            rating: self.rating.first(el).and_then(|r| parse_rating(&r)),
            date: self.date.first(el),
            media_refs: clean_media_refs(media_urls(&self.media, el), self.media_host.as_deref()),
            option_text: self.option_text.first(el),
            answer: self.answer.first(el),
            status: self.status.first(el),
        };

        if !item.is_meaningful() {
            debug!(id = ?item.external_id, "dropping item without body or rating");
            return None;
        }
        Some(item)
    }
}

impl Extract for HtmlExtractor {
    fn extract(&self, content: &str) -> Result<Vec<Item>, ExtractError> {
        let doc = Html::parse_document(content);
        let containers = self
            .items
            .iter()
            .map(|sel| doc.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();

        let found = containers.len();
        let items: Vec<Item> = containers
            .into_iter()
            .filter_map(|el| self.item_from(el))
            .collect();
        debug!(found, kept = items.len(), "extracted page");
        Ok(items)
    }
}

fn parse_rating(raw: &str) -> Option<u8> {
    RATING_RE
        .find(raw)
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|r| (1..=5).contains(r))
}
