//! Integration tests for `CrawlService` against the mock catalog.

use std::collections::HashMap;
use std::time::Duration;

use lapbot_core::table::{count_rows, read_table};
use lapbot_core::{CrawlConfig, CrawlService, SilentReporter};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{MockCatalogSource, write_file};

fn config() -> CrawlConfig {
    CrawlConfig::default()
        .with_page_delay(Duration::ZERO)
        .with_comment_page_delay(Duration::ZERO)
}

fn comment(id: u32, question: &str) -> Value {
    json!({
        "id": id,
        "content": question,
        "customer": {"id": id * 10, "fullname": "Khách"},
        "children": [{"content": "Dạ", "is_admin": 1, "customer": {"id": 1, "fullname": "QTV"}}]
    })
}

fn addon(id: &str, attribute: &str) -> Value {
    json!({
        "general": {
            "product_id": id,
            "name": format!("Phụ kiện {id}"),
            "attributes": {attribute: "yes"}
        },
        "filterable": {"price": 100000}
    })
}

// =============================================================================
// Products
// =============================================================================

#[tokio::test]
async fn test_crawl_products_writes_union_of_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("products.csv");
    let mut source = MockCatalogSource::new();
    source.products = vec![
        json!({"general": {"product_id": 1, "name": "A", "attributes": {"vga": "RTX 3050"}}}),
        json!({"general": {"product_id": 2, "name": "B", "attributes": {"battery": "56Wh"}}}),
    ];
    let service = CrawlService::new(source, config());

    let stats = service.crawl_products(&output, &SilentReporter).await.unwrap();

    assert_eq!(stats.records, 2);
    let table = read_table(&output).unwrap();
    assert_eq!(table.headers[0], "product_id");
    let n = table.headers.len();
    assert_eq!(&table.headers[n - 2..], ["battery", "vga"]);
    assert_eq!(table.get(0, "vga"), Some("RTX 3050"));
    assert_eq!(table.get(0, "battery"), None);
    assert_eq!(table.get(1, "battery"), Some("56Wh"));
}

// =============================================================================
// Questions
// =============================================================================

#[tokio::test]
async fn test_crawl_questions_stops_on_repeated_page() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("qa.csv");
    let mut source = MockCatalogSource::new();
    source.comment_pages = vec![
        vec![comment(1, "Pin trâu không?"), comment(2, "Có bảo hành không?")],
        vec![comment(3, "Nặng bao nhiêu?")],
        vec![comment(3, "Nặng bao nhiêu?")],
    ];
    let service = CrawlService::new(source.clone(), config());

    let stats = service
        .crawl_questions(&output, None, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.pages, 2);
    assert_eq!(stats.records, 3);
    assert_eq!(*source.comment_requests.lock().unwrap(), vec![1, 2, 3]);

    let table = read_table(&output).unwrap();
    assert_eq!(table.get(0, "question"), Some("Pin trâu không?"));
    assert_eq!(table.get(0, "answerer_names"), Some("QTV"));
    assert_eq!(table.get(0, "is_admin"), Some("1"));
}

#[tokio::test]
async fn test_crawl_questions_respects_max_pages_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("qa.csv");
    let mut source = MockCatalogSource::new();
    source.comment_pages = vec![vec![comment(1, "a")], vec![comment(2, "b")]];
    let service = CrawlService::new(source, config());

    let first = service
        .crawl_questions(&output, Some(1), &SilentReporter, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.records, 1);

    let second = service
        .crawl_questions(&output, None, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.records, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(count_rows(&output).unwrap(), 2);
}

#[tokio::test]
async fn test_crawl_questions_retries_timeouts() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("qa.csv");
    let mut source = MockCatalogSource::new().with_comment_timeouts(1, 2);
    source.comment_pages = vec![vec![comment(1, "a")]];
    let service = CrawlService::new(source.clone(), config());

    let stats = service
        .crawl_questions(&output, None, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.records, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(*source.comment_requests.lock().unwrap(), vec![1, 1, 1, 2]);
}

#[tokio::test]
async fn test_crawl_questions_gives_up_after_repeated_timeouts() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("qa.csv");
    let mut source = MockCatalogSource::new().with_comment_timeouts(1, 10);
    source.comment_pages = vec![vec![comment(1, "a")]];
    let service = CrawlService::new(source.clone(), config());

    let stats = service
        .crawl_questions(&output, None, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.records, 0);
    assert_eq!(stats.failed, 1);
    // First try plus max_page_retries
    assert_eq!(source.comment_requests.lock().unwrap().len(), 4);
}

// =============================================================================
// Add-ons
// =============================================================================

#[tokio::test]
async fn test_crawl_addons_skips_done_and_widens_header() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("addons.csv");

    let mut source = MockCatalogSource::new();
    source.recommendations = HashMap::from([(
        "100".to_string(),
        vec!["a1".to_string(), "a2".to_string()],
    )]);
    source.details = HashMap::from([
        ("a1".to_string(), addon("a1", "Color")),
        ("a2".to_string(), addon("a2", "DPI")),
        ("b1".to_string(), addon("b1", "Weight")),
    ]);
    let service = CrawlService::new(source.clone(), config());

    let roots = vec!["100".into(), "200".into(), "100".into(), " ".into()];
    let stats = service
        .crawl_addons(roots, &output, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.records, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 2);
    let table = read_table(&output).unwrap();
    assert_eq!(table.headers[0], "root_laptop_id");
    assert!(table.column_index("attr_color").is_some());
    assert!(table.column_index("attr_dpi").is_some());

    // Root 200 becomes available on a later run
    source
        .recommendations
        .insert("200".to_string(), vec!["b1".to_string()]);
    let service = CrawlService::new(source, config());
    let stats = service
        .crawl_addons(
            vec!["100".into(), "200".into()],
            &output,
            &SilentReporter,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.records, 1);
    assert_eq!(stats.skipped, 1);
    let table = read_table(&output).unwrap();
    assert_eq!(table.len(), 3);
    let weight = table.column_index("attr_weight").unwrap();
    assert!(weight > table.column_index("attr_dpi").unwrap());
    assert_eq!(table.get(0, "attr_weight"), None);
    assert_eq!(table.get(2, "attr_weight"), Some("yes"));
    assert_eq!(table.get(2, "root_laptop_id"), Some("200"));
}

#[tokio::test]
async fn test_crawl_addons_failed_batch_retries_whole_root() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("addons.csv");

    let mut source = MockCatalogSource::new().with_detail_failures("a2", 1);
    source.recommendations = HashMap::from([(
        "100".to_string(),
        vec!["a1".to_string(), "a2".to_string()],
    )]);
    source.details = HashMap::from([
        ("a1".to_string(), addon("a1", "Color")),
        ("a2".to_string(), addon("a2", "DPI")),
    ]);
    let mut small_batches = config();
    small_batches.detail_batch_size = 1;

    let service = CrawlService::new(source.clone(), small_batches.clone());
    let stats = service
        .crawl_addons(vec!["100".into()], &output, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.records, 0);
    assert_eq!(count_rows(&output).unwrap(), 0);

    let service = CrawlService::new(source, small_batches);
    let stats = service
        .crawl_addons(vec!["100".into()], &output, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.records, 2);
    assert_eq!(count_rows(&output).unwrap(), 2);
}

#[tokio::test]
async fn test_crawl_addons_cancelled_root_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("addons.csv");
    let token = CancellationToken::new();

    let mut source = MockCatalogSource::new();
    source.recommendations = HashMap::from([(
        "100".to_string(),
        vec!["a1".to_string(), "a2".to_string()],
    )]);
    source.details = HashMap::from([
        ("a1".to_string(), addon("a1", "Color")),
        ("a2".to_string(), addon("a2", "DPI")),
    ]);
    source.cancel_after_details = Some(token.clone());
    let mut small_batches = config();
    small_batches.detail_batch_size = 1;
    let service = CrawlService::new(source, small_batches);

    let stats = service
        .crawl_addons(vec!["100".into()], &output, &SilentReporter, token)
        .await
        .unwrap();

    assert_eq!(stats.records, 0);
    assert_eq!(count_rows(&output).unwrap(), 0);
}

// =============================================================================
// Listing and variant pages
// =============================================================================

const LISTING: &str = r#"
<div class="block-product-list-filter">
  <a class="product__link button__link" href="/laptop-a.html">A</a>
  <a class="product__link button__link" href="/laptop-b.html">B</a>
</div>"#;

const PRODUCT_PAGE: &str = r#"
<div id="block-comment-cps" product-id="7"></div>
<ul class="list-variants">
  <li data-product-id="71"><a href="/a-bac.html"><img alt="A Bạc" src="a.png">
    <strong class="item-variant-name">Bạc</strong></a></li>
  <li data-product-id="72"><a href="/a-den.html"><img alt="A Đen" src="b.png">
    <strong class="item-variant-name">Đen</strong></a></li>
</ul>"#;

#[tokio::test]
async fn test_collect_product_urls_dedupes() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("urls.csv");
    write_file(&output, "url\nhttps://cellphones.com.vn/laptop-a.html\n");

    let mut source = MockCatalogSource::new();
    source.pages = HashMap::from([(
        "https://cellphones.com.vn/laptop.html".to_string(),
        LISTING.to_string(),
    )]);
    let service = CrawlService::new(source, config());

    let listings = vec![
        "https://cellphones.com.vn/laptop.html".to_string(),
        "https://cellphones.com.vn/laptop-gaming.html".to_string(),
    ];
    let stats = service
        .collect_product_urls(&listings, &output, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.records, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 1);
    let table = read_table(&output).unwrap();
    assert_eq!(table.get(1, "url"), Some("https://cellphones.com.vn/laptop-b.html"));
}

#[tokio::test]
async fn test_crawl_variants_filters_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("variants.csv");
    let good = "https://cellphones.com.vn/laptop-a.html".to_string();
    let missing = "https://cellphones.com.vn/gone.html".to_string();

    let mut source = MockCatalogSource::new();
    source.pages = HashMap::from([(good.clone(), PRODUCT_PAGE.to_string())]);
    let service = CrawlService::new(source.clone(), config());

    let urls = vec![
        good.clone(),
        "https://other-shop.vn/laptop-a.html".to_string(),
        good.clone(),
        missing.clone(),
    ];
    let stats = service
        .crawl_variants(urls.clone(), &output, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.pages, 1);
    assert_eq!(stats.records, 2);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.failed, 1);

    let table = read_table(&output).unwrap();
    assert_eq!(table.get(0, "root_product_id"), Some("7"));
    assert_eq!(table.get(0, "url"), Some(good.as_str()));

    let stats = service
        .crawl_variants(urls, &output, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.records, 0);
    assert_eq!(stats.skipped, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(
        source
            .page_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == good)
            .count(),
        1
    );
}
