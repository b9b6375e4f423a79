use anyhow::Result;
use serde::Serialize;

use crate::crawler::{CrawlOutcome, StopReason};
use crate::db::{SaveReport, Stats};
use crate::parser::Item;

#[derive(Serialize)]
pub struct CrawlReport<'a> {
    success: bool,
    reviews: &'a [Item],
    count: usize,
    pages_crawled: u32,
    stop_reason: StopReason,
    product_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved: Option<SaveReport>,
}

impl<'a> CrawlReport<'a> {
    pub fn new(outcome: &'a CrawlOutcome, product_url: &'a str, saved: Option<SaveReport>) -> Self {
        CrawlReport {
            success: true,
            reviews: &outcome.items,
            count: outcome.items.len(),
            pages_crawled: outcome.pages_crawled,
            stop_reason: outcome.stop_reason,
            product_url,
            warning: outcome.error.as_deref(),
            saved,
        }
    }
}

#[derive(Serialize)]
pub struct Success<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

impl<T: Serialize> Success<T> {
    pub fn new(body: T) -> Self {
        Success {
            success: true,
            body,
        }
    }
}

pub type SaveSummary = Success<SaveReport>;
pub type StatsSummary = Success<Stats>;

#[derive(Serialize)]
struct Failure<'a> {
    success: bool,
    error: &'a str,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_failure(error: &anyhow::Error) {
    let message = format!("{:#}", error);
    let failure = Failure {
        success: false,
        error: &message,
    };
    match serde_json::to_string_pretty(&failure) {
        Ok(json) => println!("{}", json),
        Err(_) => println!(r#"{{"success": false}}"#),
    }
}
