//! JSON review API responses.
//!
//! The storefront has served reviews from several endpoints over time, each
//! with its own field names. Every known layout is one variant of
//! [`ApiResponse`]; anything else is rejected instead of guessed at. Entries
//! inside a known layout are read one at a time, so a malformed entry is
//! dropped on its own.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::normalize::clean_media_refs;
use super::{Extract, ExtractError, Item, ANONYMOUS};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Num(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiResponse {
    Contents { contents: Vec<Value> },
    Reviews { reviews: Vec<Value> },
    Data { data: Vec<Value> },
}

/// `/contents/reviews/product-reviews`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentsReview {
    id: Option<RawId>,
    review_score: Option<f64>,
    writer_nickname: Option<String>,
    create_date: Option<String>,
    #[serde(default)]
    review_content: String,
    product_option_content: Option<String>,
    #[serde(default)]
    review_attaches: Vec<Attach>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attach {
    attach_url: String,
}

/// `/reviews/paged-reviews`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagedReview {
    review_id: Option<RawId>,
    #[serde(alias = "rating")]
    score: Option<f64>,
    buyer_nickname: Option<String>,
    written_date: Option<String>,
    #[serde(default)]
    content: String,
    option_value: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyReview {
    review_no: Option<RawId>,
    star_score: Option<f64>,
    writer: Option<String>,
    register_date: Option<String>,
    #[serde(default)]
    body: String,
    option_value: Option<String>,
    #[serde(default)]
    image_urls: Vec<String>,
}

impl From<ContentsReview> for Item {
    fn from(r: ContentsReview) -> Self {
        build(
            r.id,
            r.writer_nickname,
            r.review_content,
            r.review_score,
            r.create_date,
            r.review_attaches.into_iter().map(|a| a.attach_url).collect(),
            r.product_option_content,
        )
    }
}

impl From<PagedReview> for Item {
    fn from(r: PagedReview) -> Self {
        build(
            r.review_id,
            r.buyer_nickname,
            r.content,
            r.score,
            r.written_date,
            r.images,
            r.option_value,
        )
    }
}

impl From<LegacyReview> for Item {
    fn from(r: LegacyReview) -> Self {
        build(
            r.review_no,
            r.writer,
            r.body,
            r.star_score,
            r.register_date,
            r.image_urls,
            r.option_value,
        )
    }
}

fn build(
    id: Option<RawId>,
    author: Option<String>,
    body: String,
    score: Option<f64>,
    date: Option<String>,
    media: Vec<String>,
    option_text: Option<String>,
) -> Item {
    Item {
        external_id: id.map(RawId::into_string),
        author: non_blank(author).unwrap_or_else(|| ANONYMOUS.to_string()),
        body: body.trim().to_string(),
        rating: score
            .map(f64::round)
            .filter(|s| (1.0..=5.0).contains(s))
            .map(|s| s as u8),
        date: non_blank(date),
        media_refs: clean_media_refs(media, None),
        option_text: non_blank(option_text),
        answer: None,
        status: None,
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn entries<T>(raw: Vec<Value>) -> Vec<Item>
where
    T: DeserializeOwned + Into<Item>,
{
    raw.into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value::<T>(entry) {
            Ok(r) => Some(r.into()),
            Err(e) => {
                debug!(index = i, "skipping malformed api entry: {}", e);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApiExtractor;

impl Extract for ApiExtractor {
    fn extract(&self, content: &str) -> Result<Vec<Item>, ExtractError> {
        let value: Value = serde_json::from_str(content)?;
        let response = ApiResponse::deserialize(&value)
            .map_err(|_| ExtractError::UnknownShape(describe(&value)))?;

        let items: Vec<Item> = match response {
            ApiResponse::Contents { contents } => entries::<ContentsReview>(contents),
            ApiResponse::Reviews { reviews } => entries::<PagedReview>(reviews),
            ApiResponse::Data { data } => entries::<LegacyReview>(data),
        };
        let found = items.len();
        let items: Vec<Item> = items.into_iter().filter(Item::is_meaningful).collect();
        debug!(found, kept = items.len(), "extracted api page");
        Ok(items)
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(map) if map.is_empty() => "none".to_string(),
        Value::Object(map) => map.keys().cloned().collect::<Vec<_>>().join(", "),
        Value::Array(_) => "<array>".to_string(),
        _ => "<scalar>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/api/{}", name)).unwrap()
    }

    #[test]
    fn contents_and_paged_shapes_agree() {
        let a = ApiExtractor.extract(&fixture("contents.json")).unwrap();
        let b = ApiExtractor.extract(&fixture("paged_reviews.json")).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a, b);

        assert_eq!(a[0].external_id.as_deref(), Some("3300112"));
        assert_eq!(a[0].rating, Some(5));
        assert_eq!(a[0].author, "kim****");
        assert_eq!(a[0].date.as_deref(), Some("2024-12-15T10:00:00.000+0900"));
        assert_eq!(
            a[0].media_refs,
            vec!["https://phinf.pstatic.net/review/x.jpg".to_string()]
        );
        assert_eq!(a[1].external_id.as_deref(), Some("r-77"));
        assert_eq!(a[1].author, ANONYMOUS);
        assert_eq!(a[1].option_text, None);
    }

    #[test]
    fn legacy_data_shape() {
        let raw = r#"{"data": [{"reviewNo": 9, "starScore": 3, "writer": "lee",
                      "registerDate": "2023.07.01", "body": "average but cheap",
                      "imageUrls": []}], "total": 1}"#;
        let items = ApiExtractor.extract(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id.as_deref(), Some("9"));
        assert_eq!(items[0].rating, Some(3));
    }

    #[test]
    fn unratable_short_entries_are_dropped() {
        let raw = r#"{"reviews": [{"reviewId": 1, "content": "ok"},
                                  {"reviewId": 2, "content": "ok", "score": 0}]}"#;
        assert!(ApiExtractor.extract(raw).unwrap().is_empty());
    }

    #[test]
    fn malformed_entry_is_skipped_alone() {
        let raw = r#"{"contents": [
            {"id": 1, "reviewScore": 5, "reviewContent": "great chair, very sturdy"},
            {"id": 2, "reviewScore": "five", "reviewContent": "wobbly after a week"},
            {"id": -3, "reviewScore": 4, "reviewContent": "negative ids are not ours"},
            {"id": 4, "reviewScore": 2, "reviewContent": "photo link was broken",
             "reviewAttaches": [{"attachType": "PHOTO"}]}
        ]}"#;
        let items = ApiExtractor.extract(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id.as_deref(), Some("1"));
        assert_eq!(items[0].body, "great chair, very sturdy");
    }

    #[test]
    fn text_ids_are_trimmed_once() {
        let raw = r#"{"reviews": [{"reviewId": " r-9 ", "content": "fits the desk well"}]}"#;
        let items = ApiExtractor.extract(raw).unwrap();
        assert_eq!(items[0].external_id.as_deref(), Some("r-9"));
    }

    #[test]
    fn non_list_envelope_is_unknown() {
        let err = ApiExtractor.extract(r#"{"contents": "none"}"#).unwrap_err();
        assert!(matches!(err, ExtractError::UnknownShape(_)));
    }

    #[test]
    fn unknown_shape_is_a_page_error() {
        let err = ApiExtractor
            .extract(r#"{"result": {"items": []}, "code": 0}"#)
            .unwrap_err();
        match err {
            ExtractError::UnknownShape(keys) => {
                assert!(keys.contains("result"));
                assert!(keys.contains("code"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn html_is_not_json() {
        let err = ApiExtractor.extract("<html></html>").unwrap_err();
        assert!(matches!(err, ExtractError::NotJson(_)));
    }
}
