//! Integration tests for cancellation support in the services.

use std::time::Duration;

use lapbot_core::table::count_rows;
use lapbot_core::{CrawlConfig, CrawlService, EnrichService, EnrichStatus, SilentReporter};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{MockCatalogSource, MockLlmProvider, fast_config, write_file};

const ANSWER: &str = r#"{"original_question": "", "keep_question": 1,
  "corrected_question": null, "assigned_intent_id": [1]}"#;

fn ten_questions(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("q.csv");
    let mut content = String::from("content\n");
    for i in 0..10 {
        content.push_str(&format!("laptop cho sinh viên {i}\n"));
    }
    write_file(&path, &content);
    path
}

#[tokio::test]
async fn test_cancellation_before_start() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let input = ten_questions(dir.path());
    let output = dir.path().join("out.csv");
    let provider = MockLlmProvider::always(ANSWER);
    let service = EnrichService::new(provider.clone(), fast_config());

    let token = CancellationToken::new();
    token.cancel();

    // Act
    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, token)
        .await
        .unwrap();

    // Assert
    assert!(result.is_cancelled());
    assert_eq!(result.stats.processed(), 0);
    assert_eq!(provider.call_count(), 0);
    assert_eq!(count_rows(&output).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_processing_then_resume() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let input = ten_questions(dir.path());
    let output = dir.path().join("out.csv");
    let slow = MockLlmProvider::always(ANSWER).with_delay(Duration::from_millis(50));
    let service = EnrichService::new(
        slow.clone(),
        fast_config().with_concurrency(1).with_checkpoint_batch_size(100),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(120)).await;
        canceller.cancel();
    });

    // Act
    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, token)
        .await
        .unwrap();

    // Assert: finished items were flushed despite the large batch size
    assert_eq!(result.status, EnrichStatus::Cancelled);
    let written = result.stats.rows_written;
    assert!(written > 0 && written < 10, "wrote {written} rows");
    assert_eq!(count_rows(&output).unwrap(), written);

    // Resume picks up exactly the rest
    let fresh = MockLlmProvider::always(ANSWER);
    let resumed = EnrichService::new(fresh.clone(), fast_config())
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resumed.status, EnrichStatus::Completed);
    assert_eq!(resumed.stats.skipped_done, written);
    assert_eq!(fresh.call_count(), 10 - written);
    assert_eq!(count_rows(&output).unwrap(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\nmột câu hỏi\n");
    let output = dir.path().join("out.csv");

    let provider = MockLlmProvider::new(|_, _| Err(lapbot_core::AppError::Timeout(30)));
    let config = fast_config().with_retry(lapbot_core::RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_secs(3600),
    });
    let service = EnrichService::new(provider.clone(), config);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(10)).await;
        canceller.cancel();
    });

    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, token)
        .await
        .unwrap();

    assert!(result.is_cancelled());
    assert_eq!(provider.call_count(), 1);
    assert_eq!(result.stats.processed(), 0);
}

#[tokio::test]
async fn test_crawl_cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("qa.csv");
    let source = MockCatalogSource::new();
    let service = CrawlService::new(source.clone(), CrawlConfig::default());

    let token = CancellationToken::new();
    token.cancel();

    let stats = service
        .crawl_questions(&output, None, &SilentReporter, token)
        .await
        .unwrap();

    assert_eq!(stats.records, 0);
    assert!(source.comment_requests.lock().unwrap().is_empty());
}
