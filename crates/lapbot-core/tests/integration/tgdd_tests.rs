//! Integration tests for `TgddCrawler` against mock pages.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use lapbot_core::table::read_table;
use lapbot_core::tgdd::{COLOR_PAGES_FILE, PAGE_SOURCE_DIR, STATUS_FILE};
use lapbot_core::{AppError, CrawlConfig, StatusLog, TgddCrawler};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{MockCatalogSource, RecordingReporter};

const LISTING: &str = "https://www.thegioididong.com/laptop?c=44&o=13";
const LAPTOP_A: &str = "https://www.thegioididong.com/laptop/asus-vivobook-go-15";
const LAPTOP_B: &str = "https://www.thegioididong.com/laptop/hp-15-fc0085au";
const A_SILVER: &str = "https://www.thegioididong.com/laptop/asus-vivobook-go-15?code=11";
const A_BLACK: &str = "https://www.thegioididong.com/laptop/asus-vivobook-go-15?code=12";

const FIRST_LISTING_PAGE: &str = r#"
    <ul class="listproduct">
      <li class="item __cate_44"><a href="/laptop/asus-vivobook-go-15">Asus</a></li>
    </ul>
    <div class="view-more"><a class="see-more-btn">Xem thêm <span class="remain">25</span></a></div>
"#;

const FULL_LISTING_PAGE: &str = r#"
    <ul class="listproduct">
      <li class="item __cate_44"><a href="/laptop/asus-vivobook-go-15">Asus</a></li>
      <li class="item __cate_44"><a href="/laptop/hp-15-fc0085au">HP</a></li>
    </ul>
"#;

const PAGE_WITH_COLOURS: &str = r#"
    <h1>Asus Vivobook Go 15</h1>
    <div class="box03 color group desk">
      <a href="/laptop/asus-vivobook-go-15?code=11" data-code="11">Bạc</a>
      <a href="/laptop/asus-vivobook-go-15?code=12" data-code="12">Đen</a>
    </div>
"#;

fn config() -> CrawlConfig {
    CrawlConfig::default()
        .with_page_delay(Duration::ZERO)
        .with_concurrency(1)
}

fn listing_page(pi: usize) -> String {
    format!("{LISTING}&pi={pi}")
}

fn catalog(with_black: bool) -> MockCatalogSource {
    let mut pages = HashMap::from([
        (listing_page(0), FIRST_LISTING_PAGE.to_string()),
        (listing_page(2), FULL_LISTING_PAGE.to_string()),
        (LAPTOP_A.to_string(), PAGE_WITH_COLOURS.to_string()),
        (A_SILVER.to_string(), "<h1>Asus bạc</h1>".to_string()),
        (LAPTOP_B.to_string(), "<h1>HP 15</h1>".to_string()),
    ]);
    if with_black {
        pages.insert(A_BLACK.to_string(), "<h1>Asus đen</h1>".to_string());
    }
    let mut source = MockCatalogSource::new();
    source.pages = pages;
    source
}

fn requests_for(source: &MockCatalogSource, url: &str) -> usize {
    source
        .page_requests
        .lock()
        .unwrap()
        .iter()
        .filter(|u| *u == url)
        .count()
}

fn saved_page(dir: &Path, filename_color: &str) -> Value {
    let path = dir.join(PAGE_SOURCE_DIR).join(filename_color);
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_tgdd_saves_one_page_per_colour() {
    let dir = tempfile::tempdir().unwrap();
    let source = catalog(true);
    let crawler = TgddCrawler::new(source.clone(), config());
    let reporter = RecordingReporter::default();

    let stats = crawler
        .crawl(Some(LISTING), dir.path(), &reporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.failed, 0);
    assert_eq!(stats.records, 3);
    assert_eq!(stats.pages, 5);

    let status = StatusLog::load(&dir.path().join(STATUS_FILE)).unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.is_done(LAPTOP_A));
    assert!(status.is_done(LAPTOP_B));
    let name_a = status.get(LAPTOP_A).unwrap().name.clone();
    assert!(name_a.starts_with("l0_") && name_a.ends_with(".json"));
    assert!(status.get(LAPTOP_B).unwrap().name.starts_with("l1_"));

    let colours = read_table(&dir.path().join(COLOR_PAGES_FILE)).unwrap();
    assert_eq!(colours.len(), 3);
    let codes: Vec<&str> = (0..3).filter_map(|r| colours.get(r, "color_code")).collect();
    assert_eq!(codes, vec!["11", "12", "0"]);
    assert_eq!(colours.get(0, "name"), Some(name_a.as_str()));
    assert_eq!(colours.get(2, "color_link"), Some(LAPTOP_B));

    let silver = saved_page(dir.path(), &format!("11__{name_a}"));
    assert_eq!(silver["link"], A_SILVER);
    assert_eq!(silver["page_source"], "<h1>Asus bạc</h1>");
    assert!(silver["time_crawled"].as_str().unwrap().contains('T'));

    // The page without colours is reused, not fetched twice
    assert_eq!(requests_for(&source, LAPTOP_B), 1);
}

#[tokio::test]
async fn test_tgdd_rerun_skips_done_links() {
    let dir = tempfile::tempdir().unwrap();
    let source = catalog(true);
    let crawler = TgddCrawler::new(source.clone(), config());
    crawler
        .crawl(Some(LISTING), dir.path(), &RecordingReporter::default(), CancellationToken::new())
        .await
        .unwrap();

    let stats = crawler
        .crawl(Some(LISTING), dir.path(), &RecordingReporter::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.records, 0);
    assert_eq!(requests_for(&source, LAPTOP_A), 1);
    assert_eq!(requests_for(&source, &listing_page(0)), 2);
    assert_eq!(read_table(&dir.path().join(STATUS_FILE)).unwrap().len(), 4);
}

#[tokio::test]
async fn test_tgdd_failed_colour_keeps_link_pending() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();

    let stats = TgddCrawler::new(catalog(false), config())
        .crawl(Some(LISTING), dir.path(), &reporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.records, 1);
    let status = StatusLog::load(&dir.path().join(STATUS_FILE)).unwrap();
    assert!(!status.is_done(LAPTOP_A));
    assert!(status.is_done(LAPTOP_B));
    assert_eq!(read_table(&dir.path().join(COLOR_PAGES_FILE)).unwrap().len(), 1);

    // Retry without discovery once the missing colour page is back
    let source = catalog(true);
    let stats = TgddCrawler::new(source.clone(), config())
        .crawl(None, dir.path(), &reporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.failed, 0);
    assert_eq!(stats.records, 2);
    assert_eq!(requests_for(&source, &listing_page(0)), 0);
    assert_eq!(requests_for(&source, LAPTOP_B), 0);
    let status = StatusLog::load(&dir.path().join(STATUS_FILE)).unwrap();
    assert!(status.is_done(LAPTOP_A));
    assert!(status.pending().is_empty());
}

#[tokio::test]
async fn test_tgdd_listing_without_counter_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = catalog(true);
    source.pages.insert(listing_page(0), FULL_LISTING_PAGE.to_string());

    let err = TgddCrawler::new(source.clone(), config())
        .crawl(Some(LISTING), dir.path(), &RecordingReporter::default(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PageLayout(_)));
    assert_eq!(requests_for(&source, LAPTOP_A), 0);
    assert!(StatusLog::load(&dir.path().join(STATUS_FILE)).unwrap().is_empty());
}

#[tokio::test]
async fn test_tgdd_cancelled_run_leaves_links_pending() {
    let dir = tempfile::tempdir().unwrap();
    let crawler = TgddCrawler::new(catalog(true), config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stats = crawler
        .crawl(Some(LISTING), dir.path(), &RecordingReporter::default(), cancel)
        .await
        .unwrap();

    assert_eq!(stats.records, 0);
    let status = StatusLog::load(&dir.path().join(STATUS_FILE)).unwrap();
    assert_eq!(status.pending().len(), 2);
}
