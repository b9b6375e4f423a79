mod crawler;
mod db;
mod fetch;
mod output;
mod parser;
mod settings;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info};

use crate::fetch::{AnyProvider, Pager, ProviderKind};
use crate::parser::{Extractor, Item, Profile};
use crate::settings::Settings;

#[derive(Parser)]
#[command(
    name = "review_harvester",
    about = "Crawl storefront reviews and Q&A into SQLite"
)]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Settings file (default: ./review_harvester.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a listing page by page and print the deduplicated items
    Crawl {
        /// Product or listing URL
        url: String,
        /// Max pages to crawl (default from settings: 3)
        #[arg(short = 'n', long)]
        pages: Option<u32>,
        #[arg(long, value_enum, default_value_t = ProviderKind::Http)]
        provider: ProviderKind,
        #[arg(long, value_enum, default_value_t = Profile::Review)]
        profile: Profile,
        /// Directory of saved pages for `--provider dir`
        #[arg(long)]
        from_dir: Option<PathBuf>,
        /// Also store the items
        #[arg(long)]
        save: bool,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Per-call provider timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Pause between pages in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Store items from a crawl output file (`-` for stdin)
    Save {
        input: String,
        /// Overrides the product URL recorded in the input
        #[arg(long)]
        product_url: Option<String>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show database statistics
    Stats {
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Accepted `save` input: a crawl report or a bare item list.
#[derive(Deserialize)]
#[serde(untagged)]
enum SaveInput {
    Report {
        #[serde(alias = "data")]
        reviews: Vec<Item>,
        #[serde(default)]
        product_url: Option<String>,
    },
    Items(Vec<Item>),
}

impl SaveInput {
    fn into_parts(self) -> (Vec<Item>, Option<String>) {
        match self {
            SaveInput::Report {
                reviews,
                product_url,
            } => (reviews, product_url),
            SaveInput::Items(items) => (items, None),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,review_harvester=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

/// Help and version output keep clap's own exit; every other parse error
/// is reported as a JSON failure.
fn is_usage_error(e: &clap::Error) -> bool {
    !matches!(
        e.kind(),
        ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    )
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if is_usage_error(&e) => {
            output::print_failure(&anyhow::Error::new(e));
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };
    init_tracing(cli.verbose);

    let t0 = Instant::now();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        output::print_failure(&e);
        std::process::exit(1);
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        info!("Done in {}", format_duration(elapsed));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Commands::Crawl {
            url,
            pages,
            provider,
            profile,
            from_dir,
            save,
            db: db_path,
            timeout,
            delay_ms,
        } => {
            let listing = fetch::parse_listing_url(&url)?;
            let extractor = Extractor::for_profile(profile, settings.profile_override(profile))
                .context("Invalid extractor profile")?;
            let pager = Pager::new(&settings.page_param, &settings.pagination)
                .context("Invalid pagination settings")?;
            let mut provider = AnyProvider::build(
                provider,
                from_dir.as_deref(),
                &settings.user_agent,
                pager,
                settings.retry_policy(),
            )?;
            let conn = if save {
                Some(open_db(&settings, db_path.as_deref())?)
            } else {
                None
            };

            let opts = settings.crawl_options(pages, timeout, delay_ms);
            info!(
                "Crawling {} (up to {} pages, {:?} profile)",
                listing, opts.max_pages, profile
            );
            let outcome = crawler::crawl(&mut provider, &extractor, listing.as_str(), &opts).await?;
            info!(
                "Collected {} items from {} pages ({:?})",
                outcome.items.len(),
                outcome.pages_crawled,
                outcome.stop_reason
            );

            let saved = match &conn {
                Some(conn) => Some(db::save(
                    conn,
                    &outcome.items,
                    Some(listing.as_str()),
                    &settings.source_label,
                )?),
                None => None,
            };
            output::print_json(&output::CrawlReport::new(&outcome, listing.as_str(), saved))
        }
        Commands::Save {
            input,
            product_url,
            db: db_path,
        } => {
            let raw = read_input(&input)?;
            let parsed: SaveInput = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a crawl output or item list", input))?;
            let (items, recorded_url) = parsed.into_parts();
            let product_url = product_url.or(recorded_url);

            let conn = open_db(&settings, db_path.as_deref())?;
            info!("Saving {} items", items.len());
            let report = db::save(
                &conn,
                &items,
                product_url.as_deref(),
                &settings.source_label,
            )?;
            output::print_json(&output::SaveSummary::new(report))
        }
        Commands::Stats { db: db_path } => {
            let conn = open_db(&settings, db_path.as_deref())?;
            let stats = db::get_stats(&conn)?;
            output::print_json(&output::StatsSummary::new(stats))
        }
    }
}

fn open_db(settings: &Settings, flag: Option<&Path>) -> Result<rusqlite::Connection> {
    let path = flag.unwrap_or(settings.db_path.as_path());
    let conn = db::connect(path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
