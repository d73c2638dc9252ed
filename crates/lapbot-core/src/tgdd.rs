//! Page-source crawler for the thegioididong.com laptop catalog.
//!
//! The listing shows twenty laptops and a "see more" button carrying the
//! number of laptops still hidden. Requesting page `pi = ceil(remaining / 20)`
//! returns the whole listing at once, from which every product link is read.
//!
//! Progress lives in two append-only CSV files in the output directory:
//!
//! - `crawled_status.csv` (`name, link, link_num, status, time_crawled`):
//!   the newest row of a link wins. Status `0` is pending, `1` done.
//! - `color_pages.csv` (`name, filename_color, color_code, color_link,
//!   time_crawled`): one row per saved page.
//!
//! Each product page is saved once per colour option it offers (or once as
//! itself when it has none) as `page_source/<code>__<name>`, a JSON object
//! holding the link, the fetch time and the raw HTML. A link is marked done
//! only after all of its colour pages are on disk, so a failed or cancelled
//! product is fetched again by the next run.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{Local, NaiveDateTime};
use futures::stream::{self, StreamExt};
use scraper::Html;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::CrawlConfig;
use crate::crawl::pause;
use crate::error::AppError;
use crate::progress::{CrawlEvent, ProgressReporter};
use crate::stats::CrawlStats;
use crate::table::{CsvAppender, Record, ToRecord, read_table};
use crate::traits::PageSource;
use crate::variants::selector;

pub const TGDD_BASE_URL: &str = "https://www.thegioididong.com";
pub const DEFAULT_TGDD_LISTING_URL: &str = "https://www.thegioididong.com/laptop?c=44&o=13";

/// Laptops added to the listing by each listing page.
pub const LISTING_PAGE_SIZE: usize = 20;
/// Name of a link whose page source has not been saved yet.
pub const UNNAMED_LINK: &str = "NN";
/// Colour code of a product page saved as itself.
pub const DEFAULT_COLOR_CODE: &str = "0";

pub const STATUS_FILE: &str = "crawled_status.csv";
pub const COLOR_PAGES_FILE: &str = "color_pages.csv";
pub const PAGE_SOURCE_DIR: &str = "page_source";

const REMAIN_SELECTOR: &str = ".see-more-btn .remain";
const PRODUCT_LINK_SELECTOR: &str = ".__cate_44 > a";
const COLOR_LINK_SELECTOR: &str = ".box03.color > a";
const COLOR_CODE_ATTR: &str = "data-code";

const SOURCE: &str = "tgdd";

fn base_url() -> Result<Url, AppError> {
    Url::parse(TGDD_BASE_URL).map_err(|e| AppError::InvalidUrl(format!("{TGDD_BASE_URL}: {e}")))
}

/// `YYYY-MM-DD HH:MM:SS`, the timestamp format of both status files.
fn status_time(time: NaiveDateTime) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Listing url for page `page`, replacing any `pi` already in `base`.
///
/// ```
/// use lapbot_core::tgdd::listing_page_url;
///
/// let url = listing_page_url("https://www.thegioididong.com/laptop?c=44&o=13", 7).unwrap();
/// assert_eq!(url, "https://www.thegioididong.com/laptop?c=44&o=13&pi=7");
/// ```
pub fn listing_page_url(base: &str, page: usize) -> Result<String, AppError> {
    let mut url = Url::parse(base).map_err(|e| AppError::InvalidUrl(format!("{base}: {e}")))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "pi")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("pi", &page.to_string());
    Ok(url.to_string())
}

/// Number of laptops hidden behind the listing's "see more" button.
///
/// # Errors
///
/// Returns [`AppError::PageLayout`] when the counter is absent or not a
/// number, which usually means the site changed its markup.
pub fn parse_remaining_count(html: &str) -> Result<usize, AppError> {
    let document = Html::parse_document(html);
    let remain_sel = selector(REMAIN_SELECTOR)?;

    let text = document
        .select(&remain_sel)
        .next()
        .map(|e| e.text().collect::<String>())
        .ok_or_else(|| AppError::PageLayout(format!("no '{REMAIN_SELECTOR}' on listing page")))?;

    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().map_err(|_| {
        AppError::PageLayout(format!("remaining count '{}' is not a number", text.trim()))
    })
}

/// Absolute product links of a listing page, deduplicated in page order.
pub fn parse_product_links(html: &str) -> Result<Vec<String>, AppError> {
    let base = base_url()?;
    let document = Html::parse_document(html);
    let link_sel = selector(PRODUCT_LINK_SELECTOR)?;

    let mut seen = HashSet::new();
    Ok(document
        .select(&link_sel)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .filter_map(|href| base.join(href).ok())
        .map(|url| url.to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect())
}

/// One colour choice of a product page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorOption {
    pub code: String,
    pub link: String,
}

/// Colour options of a product page. Empty when the page has no colour box.
pub fn parse_color_options(html: &str) -> Result<Vec<ColorOption>, AppError> {
    let base = base_url()?;
    let document = Html::parse_document(html);
    let color_sel = selector(COLOR_LINK_SELECTOR)?;

    let mut seen = HashSet::new();
    Ok(document
        .select(&color_sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?.trim();
            let link = base.join(href).ok()?.to_string();
            let code = a
                .value()
                .attr(COLOR_CODE_ATTR)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(DEFAULT_COLOR_CODE)
                .to_string();
            Some(ColorOption { code, link })
        })
        .filter(|option| !option.link.is_empty() && seen.insert(option.link.clone()))
        .collect())
}

// =============================================================================
// Status files
// =============================================================================

/// A row of the crawl status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// Base file name of the saved pages, [`UNNAMED_LINK`] until saved.
    pub name: String,
    pub link: String,
    /// Position of the link in the listing it was found in.
    pub link_num: usize,
    pub done: bool,
    pub time_crawled: String,
}

impl LinkStatus {
    pub const COLUMNS: [&'static str; 5] = ["name", "link", "link_num", "status", "time_crawled"];

    /// Base name of the page files: the stored name once a link has one,
    /// `l<link_num>_<run_stamp>.json` otherwise.
    pub fn file_name(&self, run_stamp: &str) -> String {
        if self.name.is_empty() || self.name == UNNAMED_LINK {
            format!("l{}_{run_stamp}.json", self.link_num)
        } else {
            self.name.clone()
        }
    }

    fn completed(&self, name: String, time_crawled: String) -> Self {
        Self {
            name,
            link: self.link.clone(),
            link_num: self.link_num,
            done: true,
            time_crawled,
        }
    }
}

impl ToRecord for LinkStatus {
    fn to_record(&self) -> Record {
        let status = if self.done { "1" } else { "0" };
        let values = [
            self.name.clone(),
            self.link.clone(),
            self.link_num.to_string(),
            status.to_string(),
            self.time_crawled.clone(),
        ];
        Self::COLUMNS
            .iter()
            .map(|c| c.to_string())
            .zip(values)
            .collect()
    }
}

/// A row of the colour-page file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorPage {
    pub name: String,
    pub filename_color: String,
    pub color_code: String,
    pub color_link: String,
    pub time_crawled: String,
}

impl ColorPage {
    pub const COLUMNS: [&'static str; 5] =
        ["name", "filename_color", "color_code", "color_link", "time_crawled"];
}

impl ToRecord for ColorPage {
    fn to_record(&self) -> Record {
        let values = [
            &self.name,
            &self.filename_color,
            &self.color_code,
            &self.color_link,
            &self.time_crawled,
        ];
        Self::COLUMNS
            .iter()
            .zip(values)
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect()
    }
}

/// Latest status of every known link, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct StatusLog {
    order: Vec<String>,
    latest: HashMap<String, LinkStatus>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays a status file. A missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let mut log = Self::new();
        if !path.exists() {
            return Ok(log);
        }

        let table = read_table(path)?;
        for row in 0..table.len() {
            let Some(link) = table.get(row, "link").map(str::trim) else {
                continue;
            };
            let status = table.get(row, "status").unwrap_or("0").trim();
            log.record(LinkStatus {
                name: table.get(row, "name").unwrap_or_default().trim().to_string(),
                link: link.to_string(),
                link_num: table
                    .get(row, "link_num")
                    .and_then(|n| n.trim().parse().ok())
                    .unwrap_or(0),
                done: status == "1" || status.eq_ignore_ascii_case("true"),
                time_crawled: table.get(row, "time_crawled").unwrap_or_default().to_string(),
            });
        }
        Ok(log)
    }

    /// Stores `entry` as the latest status of its link.
    pub fn record(&mut self, entry: LinkStatus) {
        if !self.latest.contains_key(&entry.link) {
            self.order.push(entry.link.clone());
        }
        self.latest.insert(entry.link.clone(), entry);
    }

    pub fn get(&self, link: &str) -> Option<&LinkStatus> {
        self.latest.get(link)
    }

    pub fn is_done(&self, link: &str) -> bool {
        self.get(link).is_some_and(|s| s.done)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Adds the links not seen before as pending and returns their rows.
    pub fn register(&mut self, links: &[String], time_crawled: &str) -> Vec<LinkStatus> {
        let mut added = Vec::new();
        for (link_num, link) in links.iter().enumerate() {
            let link = link.trim();
            if link.is_empty() || self.latest.contains_key(link) {
                continue;
            }
            let entry = LinkStatus {
                name: UNNAMED_LINK.to_string(),
                link: link.to_string(),
                link_num,
                done: false,
                time_crawled: time_crawled.to_string(),
            };
            self.record(entry.clone());
            added.push(entry);
        }
        added
    }

    /// Links still waiting for their pages, oldest first.
    pub fn pending(&self) -> Vec<LinkStatus> {
        self.order
            .iter()
            .filter_map(|link| self.latest.get(link))
            .filter(|s| !s.done)
            .cloned()
            .collect()
    }
}

#[derive(Serialize)]
struct SavedPage<'a> {
    link: &'a str,
    time_crawled: String,
    page_source: &'a str,
}

/// Writes one page source file and returns its colour-page row.
fn save_page_source(
    dir: &Path,
    file_name: &str,
    code: &str,
    link: &str,
    html: &str,
) -> Result<ColorPage, AppError> {
    let now = Local::now().naive_local();
    let filename_color = format!("{code}__{file_name}");
    let page = SavedPage {
        link,
        time_crawled: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        page_source: html,
    };
    std::fs::write(dir.join(&filename_color), serde_json::to_vec(&page)?)?;

    Ok(ColorPage {
        name: file_name.to_string(),
        filename_color,
        color_code: code.to_string(),
        color_link: link.to_string(),
        time_crawled: status_time(now),
    })
}

// =============================================================================
// Crawler
// =============================================================================

/// Saves the page sources of the thegioididong laptop catalog.
pub struct TgddCrawler<P: PageSource> {
    source: P,
    config: CrawlConfig,
}

impl<P: PageSource> TgddCrawler<P> {
    pub fn new(source: P, config: CrawlConfig) -> Self {
        Self { source, config }
    }

    /// Reads the hidden-laptop counter from the first listing page, then
    /// loads the page showing the whole listing and returns its links.
    pub async fn discover_links(&self, listing_url: &str) -> Result<Vec<String>, AppError> {
        let first = listing_page_url(listing_url, 0)?;
        let remaining = parse_remaining_count(&self.source.fetch_page(&first).await?)?;

        let last_page = remaining.div_ceil(LISTING_PAGE_SIZE);
        let full = listing_page_url(listing_url, last_page)?;
        tracing::info!(remaining, last_page, url = full.as_str(), "Loading full listing");

        let html = self.source.fetch_page(&full).await?;
        parse_product_links(&html)
    }

    /// Crawls every pending link into `output_dir`.
    ///
    /// With a `listing_url`, links found there and absent from the status
    /// file are added as pending first. Without one, only links left
    /// pending by earlier runs are crawled.
    pub async fn crawl<R: ProgressReporter>(
        &self,
        listing_url: Option<&str>,
        output_dir: &Path,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, AppError> {
        let mut stats = CrawlStats::new();
        let run_started = Local::now().naive_local();
        let run_stamp = run_started.format("%Y%m%d-%H%M%S").to_string();

        let status_path = output_dir.join(STATUS_FILE);
        let mut status = StatusLog::load(&status_path)?;
        let mut status_out = CsvAppender::open(&status_path, &LinkStatus::COLUMNS)?;

        if let Some(listing_url) = listing_url {
            let links = self.discover_links(listing_url).await?;
            stats.pages += 2;
            reporter.report_crawl(CrawlEvent::PageFetched {
                source: SOURCE,
                page: 1,
                records: links.len(),
            });
            stats.skipped += links.iter().filter(|l| status.is_done(l)).count();
            let added = status.register(&links, &status_time(run_started));
            status_out.append(&added)?;
            tracing::info!(
                found = links.len(),
                added = added.len(),
                "Listing links registered"
            );
        }

        let pages_dir = output_dir.join(PAGE_SOURCE_DIR);
        std::fs::create_dir_all(&pages_dir)?;
        let mut colors_out =
            CsvAppender::open(&output_dir.join(COLOR_PAGES_FILE), &ColorPage::COLUMNS)?;

        let cancel_ref = &cancel;
        let run_stamp = run_stamp.as_str();
        let pages_dir = pages_dir.as_path();
        let mut products = stream::iter(status.pending())
            .map(move |entry| async move {
                if cancel_ref.is_cancelled() {
                    return None;
                }
                let file_name = entry.file_name(run_stamp);
                let result = self
                    .save_product(&entry.link, &file_name, pages_dir, cancel_ref)
                    .await;
                Some((entry, file_name, result))
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(item) = products.next().await {
            let Some((entry, file_name, result)) = item else {
                continue;
            };
            match result {
                Ok(Some(pages)) => {
                    stats.pages += pages.len();
                    reporter.report_crawl(CrawlEvent::PageFetched {
                        source: SOURCE,
                        page: stats.pages,
                        records: pages.len(),
                    });
                    let written = colors_out.append(&pages)?;
                    let now = status_time(Local::now().naive_local());
                    status_out.append(&[entry.completed(file_name, now)])?;
                    stats.records += written;
                    reporter.report_crawl(CrawlEvent::RowsWritten {
                        source: SOURCE,
                        rows: written,
                        total: stats.records,
                    });
                }
                Ok(None) => {
                    tracing::debug!(link = entry.link.as_str(), "Cancelled, link left pending");
                }
                Err(e) => {
                    let message = e.to_string();
                    reporter.report_crawl(CrawlEvent::PageFailed {
                        source: SOURCE,
                        target: &entry.link,
                        error: &message,
                    });
                    stats.failed += 1;
                }
            }
        }

        reporter.report_crawl(CrawlEvent::Finished {
            source: SOURCE,
            stats: &stats,
        });
        Ok(stats)
    }

    /// Fetches a product and saves one page per colour option.
    /// Returns `None` when cancelled before every page was saved.
    async fn save_product(
        &self,
        link: &str,
        file_name: &str,
        pages_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ColorPage>>, AppError> {
        let html = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            html = self.source.fetch_page(link) => html?,
        };
        let options = parse_color_options(&html)?;

        let mut saved = Vec::with_capacity(options.len().max(1));
        if options.is_empty() {
            saved.push(save_page_source(pages_dir, file_name, DEFAULT_COLOR_CODE, link, &html)?);
        }
        for option in options {
            if pause(self.config.page_delay, cancel).await {
                return Ok(None);
            }
            let html = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                html = self.source.fetch_page(&option.link) => html?,
            };
            saved.push(save_page_source(
                pages_dir,
                file_name,
                &option.code,
                &option.link,
                &html,
            )?);
        }

        pause(self.config.page_delay, cancel).await;
        Ok(Some(saved))
    }
}
