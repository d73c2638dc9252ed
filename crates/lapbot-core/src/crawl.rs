//! Crawl orchestration over a [`CatalogSource`].
//!
//! Every crawl appends to its output file and skips what that file already
//! holds, so an interrupted crawl continues where it stopped. The one
//! exception is [`CrawlService::crawl_products`], which takes a single
//! catalog snapshot and rewrites the file.
//!
//! # Cancellation
//!
//! The token is checked before each request and interrupts the polite
//! pauses between requests. Rows fetched before cancellation are written.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::config::CrawlConfig;
use crate::error::AppError;
use crate::flatten::{
    ADDON_COLUMNS, PRODUCT_COLUMNS, dynamic_columns, flatten_addon, flatten_comment,
    flatten_product, union_columns,
};
use crate::models::{QaRecord, VariantRecord};
use crate::progress::{CrawlEvent, ProgressReporter};
use crate::stats::CrawlStats;
use crate::table::{CsvAppender, Record, Table, read_table, write_table};
use crate::traits::CatalogSource;
use crate::variants::{is_valid_product_url, parse_listing_links, parse_variants};

/// Column holding page urls in the url and variant files.
pub const URL_COLUMN: &str = "url";

/// Sleeps for `delay`. Returns `true` when cancelled first.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Appends keyed rows, widening the file header when new columns appear.
///
/// Existing rows are rewritten under the wider header, which keeps fixed
/// columns first and dynamic columns sorted.
fn append_with_union(path: &Path, fixed: &[&str], records: &[Record]) -> Result<usize, AppError> {
    if records.is_empty() {
        return Ok(0);
    }
    let incoming = dynamic_columns(fixed, records);

    let has_content = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    if has_content {
        let existing = read_table(path)?;
        let known: HashSet<&str> = existing.headers.iter().map(String::as_str).collect();
        let widened = incoming.iter().any(|c| !known.contains(c.as_str()))
            || fixed.iter().any(|c| !known.contains(c));
        if widened {
            let dynamic = existing
                .headers
                .iter()
                .filter(|h| !fixed.contains(&h.as_str()))
                .cloned()
                .chain(incoming.iter().cloned());
            let mut table = Table::new(union_columns(fixed, dynamic));
            for row in 0..existing.len() {
                table.push_record(&existing.record(row));
            }
            tracing::debug!(
                path = %path.display(),
                columns = table.headers.len(),
                "Widening output header"
            );
            write_table(path, &table)?;
        }
    }

    let header = union_columns(fixed, incoming);
    let mut appender = CsvAppender::open(path, &header)?;
    appender.append(records)
}

/// Runs the catalog crawls.
pub struct CrawlService<C: CatalogSource> {
    source: C,
    config: CrawlConfig,
}

impl<C: CatalogSource> CrawlService<C> {
    pub fn new(source: C, config: CrawlConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Fetches the product catalog once and writes one flattened row per
    /// product. Columns are the fixed product columns followed by every
    /// attribute seen in the snapshot.
    pub async fn crawl_products<R: ProgressReporter>(
        &self,
        output: &Path,
        reporter: &R,
    ) -> Result<CrawlStats, AppError> {
        let mut stats = CrawlStats::new();
        let products = self.source.fetch_products().await?;
        stats.pages = 1;
        reporter.report_crawl(CrawlEvent::PageFetched {
            source: "products",
            page: 1,
            records: products.len(),
        });

        let records: Vec<Record> = products.iter().map(flatten_product).collect();
        let header = union_columns(PRODUCT_COLUMNS, dynamic_columns(PRODUCT_COLUMNS, &records));
        let mut table = Table::new(header);
        for record in &records {
            table.push_record(record);
        }
        write_table(output, &table)?;

        stats.records = records.len();
        reporter.report_crawl(CrawlEvent::RowsWritten {
            source: "products",
            rows: records.len(),
            total: stats.records,
        });
        reporter.report_crawl(CrawlEvent::Finished {
            source: "products",
            stats: &stats,
        });
        Ok(stats)
    }

    /// Pages through customer questions starting at page 1.
    ///
    /// Stops on the first error, an empty page, a page identical to the
    /// previous one, or after `max_pages`. A timed-out page is retried up
    /// to `max_page_retries` times. Questions whose `comment_id` is already
    /// in `output` are skipped.
    pub async fn crawl_questions<R: ProgressReporter>(
        &self,
        output: &Path,
        max_pages: Option<u32>,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, AppError> {
        let mut stats = CrawlStats::new();
        let mut done = Checkpoint::load(output, "comment_id");
        let mut appender = CsvAppender::open(output, &QaRecord::COLUMNS)?;

        let mut page: u32 = 1;
        let mut timeouts = 0;
        let mut previous = None;

        loop {
            if max_pages.is_some_and(|max| page > max) || cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.fetch_comment_page(page) => result,
            };

            let comments = match result {
                Ok(comments) => comments,
                Err(AppError::Timeout(secs)) if timeouts < self.config.max_page_retries => {
                    timeouts += 1;
                    tracing::warn!(
                        page,
                        secs,
                        attempt = timeouts,
                        "Comment page timed out, retrying"
                    );
                    continue;
                }
                Err(e) => {
                    let target = format!("page {page}");
                    let message = e.to_string();
                    reporter.report_crawl(CrawlEvent::PageFailed {
                        source: "questions",
                        target: &target,
                        error: &message,
                    });
                    stats.failed += 1;
                    break;
                }
            };
            timeouts = 0;

            if comments.is_empty() {
                tracing::info!(page, "No more questions");
                break;
            }
            if previous.as_ref() == Some(&comments) {
                tracing::info!(page, "Page repeats the previous one, stopping");
                break;
            }

            stats.pages += 1;
            let mut rows = Vec::with_capacity(comments.len());
            for qa in comments.iter().map(flatten_comment) {
                if qa.comment_id.is_empty() || done.insert(&qa.comment_id) {
                    rows.push(qa);
                } else {
                    stats.skipped += 1;
                }
            }
            reporter.report_crawl(CrawlEvent::PageFetched {
                source: "questions",
                page: page as usize,
                records: comments.len(),
            });

            let written = appender.append(&rows)?;
            stats.records += written;
            reporter.report_crawl(CrawlEvent::RowsWritten {
                source: "questions",
                rows: written,
                total: stats.records,
            });

            previous = Some(comments);
            page += 1;
            if pause(self.config.comment_page_delay, &cancel).await {
                break;
            }
        }

        reporter.report_crawl(CrawlEvent::Finished {
            source: "questions",
            stats: &stats,
        });
        Ok(stats)
    }

    /// Collects the accessories recommended for each root product.
    ///
    /// Root ids already present in `output` (column `root_laptop_id`) are
    /// skipped. Details are fetched in batches of `detail_batch_size` and
    /// each root's rows are appended once every batch has arrived; a root
    /// with a failed or interrupted batch writes nothing.
    pub async fn crawl_addons<R: ProgressReporter>(
        &self,
        root_ids: Vec<String>,
        output: &Path,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, AppError> {
        let mut stats = CrawlStats::new();
        let mut done = Checkpoint::load(output, "root_laptop_id");
        let batch_size = self.config.detail_batch_size.max(1);

        for root_id in root_ids {
            let root_id = root_id.trim().to_string();
            if root_id.is_empty() || done.contains(&root_id) {
                stats.skipped += 1;
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            let addon_ids = match self.source.fetch_recommendations(&root_id).await {
                Ok(ids) => ids,
                Err(e) => {
                    let message = e.to_string();
                    reporter.report_crawl(CrawlEvent::PageFailed {
                        source: "addons",
                        target: &root_id,
                        error: &message,
                    });
                    stats.failed += 1;
                    continue;
                }
            };
            stats.pages += 1;

            let mut records = Vec::new();
            let mut complete = true;
            for chunk in addon_ids.chunks(batch_size) {
                if cancel.is_cancelled() {
                    complete = false;
                    break;
                }
                match self.source.fetch_products_by_ids(chunk).await {
                    Ok(products) => {
                        stats.pages += 1;
                        records.extend(products.iter().map(|p| flatten_addon(&root_id, p)));
                    }
                    Err(e) => {
                        let message = e.to_string();
                        reporter.report_crawl(CrawlEvent::PageFailed {
                            source: "addons",
                            target: &root_id,
                            error: &message,
                        });
                        stats.failed += 1;
                        complete = false;
                        break;
                    }
                }
            }
            // A partial root would be skipped on resume, so nothing is written for it.
            if !complete {
                tracing::debug!(
                    root_id = root_id.as_str(),
                    "Add-ons incomplete, root left for the next run"
                );
                continue;
            }

            reporter.report_crawl(CrawlEvent::PageFetched {
                source: "addons",
                page: stats.pages,
                records: records.len(),
            });
            let written = append_with_union(output, ADDON_COLUMNS, &records)?;
            stats.records += written;
            done.insert(&root_id);
            if written > 0 {
                reporter.report_crawl(CrawlEvent::RowsWritten {
                    source: "addons",
                    rows: written,
                    total: stats.records,
                });
            }
        }

        reporter.report_crawl(CrawlEvent::Finished {
            source: "addons",
            stats: &stats,
        });
        Ok(stats)
    }

    /// Reads category listing pages and appends new product links to a
    /// single-column `url` file.
    pub async fn collect_product_urls<R: ProgressReporter>(
        &self,
        listing_urls: &[String],
        output: &Path,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, AppError> {
        let mut stats = CrawlStats::new();
        let mut done = Checkpoint::load(output, URL_COLUMN);
        let mut appender = CsvAppender::open(output, &[URL_COLUMN])?;

        for (i, listing_url) in listing_urls.iter().enumerate() {
            if i > 0 && pause(self.config.page_delay, &cancel).await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            let links = match self.source.fetch_page(listing_url).await {
                Ok(html) => parse_listing_links(&html, listing_url),
                Err(e) => Err(e),
            };
            let links = match links {
                Ok(links) => links,
                Err(e) => {
                    let message = e.to_string();
                    reporter.report_crawl(CrawlEvent::PageFailed {
                        source: "urls",
                        target: listing_url,
                        error: &message,
                    });
                    stats.failed += 1;
                    continue;
                }
            };
            stats.pages += 1;
            reporter.report_crawl(CrawlEvent::PageFetched {
                source: "urls",
                page: i + 1,
                records: links.len(),
            });

            let mut rows = Vec::new();
            for link in links {
                if done.insert(&link) {
                    rows.push(Record::from([(URL_COLUMN.to_string(), link)]));
                } else {
                    stats.skipped += 1;
                }
            }
            let written = appender.append(&rows)?;
            stats.records += written;
            reporter.report_crawl(CrawlEvent::RowsWritten {
                source: "urls",
                rows: written,
                total: stats.records,
            });
        }

        reporter.report_crawl(CrawlEvent::Finished {
            source: "urls",
            stats: &stats,
        });
        Ok(stats)
    }

    /// Fetches product pages in parallel and appends their variants.
    ///
    /// Urls outside `valid_url_prefixes` and urls already present in the
    /// output `url` column are skipped. Each fetch is followed by
    /// `page_delay`. Rows are appended every `write_batch_size` variants.
    pub async fn crawl_variants<R: ProgressReporter>(
        &self,
        urls: Vec<String>,
        output: &Path,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, AppError> {
        let mut stats = CrawlStats::new();
        let done = Checkpoint::load(output, URL_COLUMN);
        let mut seen = HashSet::new();

        let mut pending = Vec::new();
        for url in urls {
            let url = url.trim().to_string();
            if !is_valid_product_url(&url, &self.config.valid_url_prefixes) {
                tracing::warn!(url = url.as_str(), "Skipping url outside the catalog");
                stats.skipped += 1;
            } else if done.contains(&url) || !seen.insert(url.clone()) {
                stats.skipped += 1;
            } else {
                pending.push(url);
            }
        }

        let mut appender = CsvAppender::open(output, &VariantRecord::COLUMNS)?;
        let batch_size = self.config.write_batch_size.max(1);
        let mut buffer: Vec<VariantRecord> = Vec::with_capacity(batch_size);

        let cancel_ref = &cancel;
        let mut pages = stream::iter(pending)
            .map(move |url| async move {
                if cancel_ref.is_cancelled() {
                    return None;
                }
                let result = tokio::select! {
                    _ = cancel_ref.cancelled() => return None,
                    html = self.source.fetch_page(&url) => {
                        html.and_then(|html| parse_variants(&html, &url))
                    }
                };
                pause(self.config.page_delay, cancel_ref).await;
                Some((url, result))
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(item) = pages.next().await {
            let Some((url, result)) = item else {
                continue;
            };
            match result {
                Ok(variants) => {
                    stats.pages += 1;
                    reporter.report_crawl(CrawlEvent::PageFetched {
                        source: "variants",
                        page: stats.pages,
                        records: variants.len(),
                    });
                    buffer.extend(variants);
                }
                Err(e) => {
                    let message = e.to_string();
                    reporter.report_crawl(CrawlEvent::PageFailed {
                        source: "variants",
                        target: &url,
                        error: &message,
                    });
                    stats.failed += 1;
                }
            }

            if buffer.len() >= batch_size {
                let written = appender.append(&buffer)?;
                buffer.clear();
                stats.records += written;
                reporter.report_crawl(CrawlEvent::RowsWritten {
                    source: "variants",
                    rows: written,
                    total: stats.records,
                });
            }
        }

        if !buffer.is_empty() {
            let written = appender.append(&buffer)?;
            stats.records += written;
            reporter.report_crawl(CrawlEvent::RowsWritten {
                source: "variants",
                rows: written,
                total: stats.records,
            });
        }

        reporter.report_crawl(CrawlEvent::Finished {
            source: "variants",
            stats: &stats,
        });
        Ok(stats)
    }
}
