use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

// "24.12.15", "24.12.15.", "2024.12.15", "2024-12-15", "2024/12/15"
static SHORT_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2}|\d{4})[./-](\d{1,2})[./-](\d{1,2})\.?$").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Resolve a source date to a UTC timestamp, falling back to `now` when the
/// text is missing or in a form we don't know.
pub fn parse_timestamp(raw: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return now;
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    // API variant without the colon in the offset: 2024-12-15T10:00:00.000+0900
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return dt.with_timezone(&Utc);
    }

    SHORT_DATE_RE
        .captures(raw)
        .and_then(|c| {
            let mut year: i32 = c[1].parse().ok()?;
            if year < 100 {
                year += 2000;
            }
            let month: u32 = c[2].parse().ok()?;
            let day: u32 = c[3].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
        })
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// Strip size/format query parameters and fragments from a media URL.
pub fn clean_media_ref(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() || url.starts_with("data:") {
        return None;
    }
    let base = url.split(['?', '#']).next().unwrap_or(url);
    let base = if base.starts_with("//") {
        format!("https:{}", base)
    } else {
        base.to_string()
    };
    Some(base)
}

/// Clean, filter by host and dedupe media URLs, keeping first-seen order.
pub fn clean_media_refs<I, S>(urls: I, host: Option<&str>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter_map(|u| clean_media_ref(u.as_ref()))
        .filter(|u| host.map_or(true, |h| u.contains(h)))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

pub fn collapse_whitespace(text: &str) -> String {
    WS_RE.replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn short_year_dates() {
        let ts = parse_timestamp(Some("24.12.15."), now());
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 12, 15, 0, 0, 0).unwrap());
        let ts = parse_timestamp(Some("24.3.5"), now());
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn long_year_and_iso_dates() {
        let day = Utc.with_ymd_and_hms(2023, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(Some("2023.07.01"), now()), day);
        assert_eq!(parse_timestamp(Some("2023-07-01"), now()), day);
        assert_eq!(
            parse_timestamp(Some("2023-07-01T09:00:00+09:00"), now()),
            day
        );
        assert_eq!(
            parse_timestamp(Some("2023-07-01T09:00:00.000+0900"), now()),
            day
        );
    }

    #[test]
    fn unparseable_dates_fall_back_to_now() {
        assert_eq!(parse_timestamp(None, now()), now());
        assert_eq!(parse_timestamp(Some("  "), now()), now());
        assert_eq!(parse_timestamp(Some("yesterday"), now()), now());
        assert_eq!(parse_timestamp(Some("24.13.40"), now()), now());
    }

    #[test]
    fn media_refs_are_stripped_and_deduped() {
        let urls = [
            "https://phinf.pstatic.net/a.jpg?type=w300",
            "https://phinf.pstatic.net/a.jpg?type=w640",
            "//phinf.pstatic.net/b.png#frag",
            "https://cdn.example.com/c.jpg",
            "data:image/gif;base64,R0lGOD",
        ];
        let cleaned = clean_media_refs(urls, Some("pstatic.net"));
        assert_eq!(
            cleaned,
            vec![
                "https://phinf.pstatic.net/a.jpg".to_string(),
                "https://phinf.pstatic.net/b.png".to_string(),
            ]
        );
        assert_eq!(clean_media_refs(urls, None).len(), 3);
    }

    #[test]
    fn whitespace_collapses() {
        assert_eq!(collapse_whitespace("  a \n\t b  c "), "a b c");
    }
}
