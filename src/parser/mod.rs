pub mod api;
pub mod html;
pub mod normalize;
pub mod strategy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use api::ApiExtractor;
use html::{HtmlExtractor, HtmlProfileSpec};

pub const ANONYMOUS: &str = "anonymous";
/// Bodies shorter than this are noise unless the item carries a rating.
pub const MIN_BODY_CHARS: usize = 5;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid CSS selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("profile has no item container selectors")]
    NoContainers,
    #[error("response is not JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("unrecognised API response shape (top-level keys: {0})")]
    UnknownShape(String),
}

/// One scraped review or Q&A entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default, alias = "id")]
    pub external_id: Option<String>,
    #[serde(default = "anonymous")]
    pub author: String,
    #[serde(default, alias = "content")]
    pub body: String,
    #[serde(default)]
    pub rating: Option<u8>,
    /// Date as shown by the source; see [`Item::timestamp`].
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "images")]
    pub media_refs: Vec<String>,
    #[serde(default, alias = "option")]
    pub option_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn anonymous() -> String {
    ANONYMOUS.to_string()
}

impl Default for Item {
    fn default() -> Self {
        Item {
            external_id: None,
            author: anonymous(),
            body: String::new(),
            rating: None,
            date: None,
            media_refs: Vec::new(),
            option_text: None,
            answer: None,
            status: None,
        }
    }
}

impl Item {
    /// Source id when there is one, otherwise a content hash over
    /// author, date and body.
    pub fn identity_key(&self) -> String {
        match self.source_id() {
            Some(id) => id.to_string(),
            None => content_key(&self.author, self.date.as_deref().unwrap_or(""), &self.body),
        }
    }

    /// Compared byte for byte. Extractors trim ids when they read them.
    pub fn source_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    /// Worth keeping: a real body, or at least a rating signal.
    pub fn is_meaningful(&self) -> bool {
        self.body.trim().chars().count() >= MIN_BODY_CHARS || self.rating.is_some()
    }

    pub fn timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        normalize::parse_timestamp(self.date.as_deref(), now)
    }
}

pub fn content_key(author: &str, date: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author.trim().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(date.trim().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(body.trim().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Turns one page's content into items. Per-item problems are swallowed;
/// an error means the page as a whole could not be interpreted.
pub trait Extract {
    fn extract(&self, content: &str) -> Result<Vec<Item>, ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// HTML review list
    Review,
    /// HTML Q&A list
    Qna,
    /// JSON review API
    Api,
}

pub enum Extractor {
    Html(HtmlExtractor),
    Api(ApiExtractor),
}

impl Extractor {
    /// Build the extractor for `profile`; `custom` replaces the built-in
    /// selectors of the HTML profiles.
    pub fn for_profile(
        profile: Profile,
        custom: Option<&HtmlProfileSpec>,
    ) -> Result<Self, ExtractError> {
        let spec = match (profile, custom) {
            (Profile::Api, _) => return Ok(Extractor::Api(ApiExtractor)),
            (_, Some(spec)) => spec.clone(),
            (Profile::Review, None) => HtmlProfileSpec::review(),
            (Profile::Qna, None) => HtmlProfileSpec::qna(),
        };
        Ok(Extractor::Html(HtmlExtractor::new(&spec)?))
    }
}

impl Extract for Extractor {
    fn extract(&self, content: &str) -> Result<Vec<Item>, ExtractError> {
        match self {
            Extractor::Html(e) => e.extract(content),
            Extractor::Api(e) => e.extract(content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: Option<&str>, author: &str, date: &str, body: &str) -> Item {
        Item {
            external_id: id.map(str::to_string),
            author: author.into(),
            date: Some(date.into()),
            body: body.into(),
            ..Default::default()
        }
    }

    #[test]
    fn identity_prefers_source_id() {
        let a = item(Some("4410"), "kim", "24.12.15", "great chair");
        assert_eq!(a.identity_key(), "4410");
        let blank = item(Some("  "), "kim", "24.12.15", "great chair");
        assert!(blank.identity_key().starts_with("sha256:"));
    }

    #[test]
    fn source_ids_match_exactly() {
        let a = item(Some("42"), "kim", "24.12.15", "great chair");
        let b = item(Some(" 42"), "kim", "24.12.15", "great chair");
        assert_eq!(b.identity_key(), " 42");
        assert_ne!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn fallback_key_is_stable_and_content_sensitive() {
        let a = item(None, "kim", "24.12.15", "great chair");
        let b = item(None, "kim", "24.12.15", "great chair");
        let c = item(None, "kim", "24.12.15", "great chair!");
        assert_eq!(a.identity_key(), b.identity_key());
        assert_ne!(a.identity_key(), c.identity_key());
        assert_eq!(a.identity_key().len(), "sha256:".len() + 64);
    }

    #[test]
    fn meaningful_needs_body_or_rating() {
        let mut i = Item::default();
        assert!(!i.is_meaningful());
        i.body = "ok!".into();
        assert!(!i.is_meaningful());
        i.rating = Some(4);
        assert!(i.is_meaningful());
        let long = Item {
            body: "arrived quickly".into(),
            ..Default::default()
        };
        assert!(long.is_meaningful());
    }

    #[test]
    fn reads_legacy_crawler_json() {
        let raw = r#"{"id": "r-1", "content": "fits well, good fabric", "author": "lee",
                      "date": "24.12.15", "rating": 4, "option": "Color: Gray",
                      "images": ["https://phinf.pstatic.net/x.jpg"]}"#;
        let item: Item = serde_json::from_str(raw).unwrap();
        assert_eq!(item.external_id.as_deref(), Some("r-1"));
        assert_eq!(item.body, "fits well, good fabric");
        assert_eq!(item.option_text.as_deref(), Some("Color: Gray"));
        assert_eq!(item.media_refs.len(), 1);

        let sparse: Item = serde_json::from_str(r#"{"content": "no author given"}"#).unwrap();
        assert_eq!(sparse.author, ANONYMOUS);
        assert_eq!(sparse.rating, None);
    }

    #[test]
    fn builds_every_profile() {
        for p in [Profile::Review, Profile::Qna, Profile::Api] {
            assert!(Extractor::for_profile(p, None).is_ok());
        }
    }
}
