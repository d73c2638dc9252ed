//! Integration tests for the enrichment commands of `EnrichService`.

use std::time::Duration;

use lapbot_core::intent::{MALFORMED_MARKER, RETURNED_NONE_MARKER};
use lapbot_core::table::{count_rows, read_table};
use lapbot_core::{
    AppError, CircuitBreakerConfig, EnrichService, EnrichStatus, GenerationPlan,
    LlmErrorDetails, LlmErrorKind, RetryPolicy, SilentReporter,
};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{MockLlmProvider, RecordingReporter, fast_config, write_file};

const INTENT_ANSWER: &str = r#"```json
{"original_question": "ignored", "keep_question": 1,
 "corrected_question": "Laptop nào tầm 15 triệu?", "assigned_intent_id": 0}
```"#;

fn questions_csv(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("questions.csv");
    write_file(
        &path,
        "content,product\n\
         Laptop nào tầm 15 triệu?,a\n\
         ,b\n\
         Máy có nặng không,c\n\
         \"  laptop nào tầm 15 triệu? \",d\n",
    );
    path
}

// =============================================================================
// Intent classification
// =============================================================================

#[tokio::test]
async fn test_classify_skips_empty_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let input = questions_csv(dir.path());
    let output = dir.path().join("intents.csv");
    let provider = MockLlmProvider::always(INTENT_ANSWER);
    let service = EnrichService::new(provider.clone(), fast_config());

    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, EnrichStatus::Completed);
    assert_eq!(result.stats.succeeded, 2);
    assert_eq!(result.stats.skipped_empty, 1);
    assert_eq!(result.stats.skipped_done, 1);
    assert_eq!(result.stats.rows_written, 2);
    assert_eq!(provider.call_count(), 2);

    let table = read_table(&output).unwrap();
    assert_eq!(
        table.headers,
        vec![
            "original_question",
            "keep_question",
            "corrected_question",
            "assigned_intent_id",
            "assigned_intent_name"
        ]
    );
    let originals: Vec<_> = (0..table.len())
        .filter_map(|row| table.get(row, "original_question"))
        .collect();
    assert!(originals.contains(&"Laptop nào tầm 15 triệu?"));
    assert!(originals.contains(&"Máy có nặng không"));
    assert_eq!(table.get(0, "assigned_intent_id"), Some("[0]"));
    assert_eq!(table.get(0, "assigned_intent_name"), Some("[\"recommend_budget\"]"));
}

#[tokio::test]
async fn test_classify_resumes_from_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = questions_csv(dir.path());
    let output = dir.path().join("intents.csv");

    let first = MockLlmProvider::always(INTENT_ANSWER);
    EnrichService::new(first, fast_config())
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    let second = MockLlmProvider::always(INTENT_ANSWER);
    let result = EnrichService::new(second.clone(), fast_config())
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.call_count(), 0);
    assert_eq!(result.stats.skipped_done, 3);
    assert_eq!(result.stats.processed(), 0);
    assert_eq!(count_rows(&output).unwrap(), 2);
}

#[tokio::test]
async fn test_classify_missing_column() {
    let dir = tempfile::tempdir().unwrap();
    let input = questions_csv(dir.path());
    let service = EnrichService::new(MockLlmProvider::always(INTENT_ANSWER), fast_config());

    let err = service
        .classify_intents(
            &input,
            &dir.path().join("out.csv"),
            "question",
            &SilentReporter,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MissingColumn(_)));
}

#[tokio::test]
async fn test_classify_writes_fallback_rows() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\nmissing keys\nnot json\nserver down\n");
    let output = dir.path().join("intents.csv");

    let provider = MockLlmProvider::new(|request, _| {
        if request.prompt.contains("missing keys") {
            Ok(r#"{"keep_question": 1}"#.to_string())
        } else if request.prompt.contains("not json") {
            Ok("I cannot answer that.".to_string())
        } else {
            Err(AppError::LlmError(LlmErrorDetails::new(
                "mock",
                LlmErrorKind::ServerError,
                "503",
                503,
            )))
        }
    });
    let service = EnrichService::new(provider.clone(), fast_config());

    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stats.fallback, 3);
    assert_eq!(result.stats.succeeded, 0);
    // Parse failures are final, the server error is retried twice
    assert_eq!(provider.call_count(), 5);

    let table = read_table(&output).unwrap();
    let marker_for = |question: &str| {
        (0..table.len())
            .find(|&row| table.get(row, "original_question") == Some(question))
            .and_then(|row| table.get(row, "corrected_question"))
            .map(str::to_string)
    };
    assert_eq!(marker_for("missing keys").as_deref(), Some(MALFORMED_MARKER));
    assert_eq!(marker_for("not json").as_deref(), Some(RETURNED_NONE_MARKER));
    assert_eq!(marker_for("server down").as_deref(), Some(RETURNED_NONE_MARKER));
    assert_eq!(table.get(0, "keep_question"), Some("0"));
    assert_eq!(table.get(0, "assigned_intent_id"), Some("[-1]"));
}

#[tokio::test]
async fn test_retry_then_success() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\nlaptop đồ họa\n");
    let output = dir.path().join("intents.csv");

    let provider = MockLlmProvider::new(|_, call| {
        if call == 0 {
            Err(AppError::LlmError(LlmErrorDetails::new(
                "mock",
                LlmErrorKind::RateLimit,
                "429",
                429,
            )))
        } else {
            Ok(INTENT_ANSWER.to_string())
        }
    });
    let service = EnrichService::new(provider.clone(), fast_config());

    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(result.stats.succeeded, 1);
}

#[tokio::test]
async fn test_authentication_error_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\nmột\nhai\n");
    let output = dir.path().join("intents.csv");

    let provider = MockLlmProvider::new(|_, _| {
        Err(AppError::LlmError(LlmErrorDetails::new(
            "mock",
            LlmErrorKind::Authentication,
            "API key not valid",
            400,
        )))
    });
    let service = EnrichService::new(provider.clone(), fast_config());

    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(result.stats.fallback, 2);
    assert_eq!(result.stats.rows_written, 2);

    let table = read_table(&output).unwrap();
    assert_eq!(table.get(0, "corrected_question"), Some(RETURNED_NONE_MARKER));
    assert_eq!(table.get(1, "corrected_question"), Some(RETURNED_NONE_MARKER));
}

#[tokio::test]
async fn test_small_batches_flush_incrementally() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    let mut content = String::from("content\n");
    for i in 0..7 {
        content.push_str(&format!("question {i}\n"));
    }
    write_file(&input, &content);
    let output = dir.path().join("intents.csv");

    let service = EnrichService::new(
        MockLlmProvider::always(INTENT_ANSWER),
        fast_config().with_checkpoint_batch_size(3),
    );
    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stats.rows_written, 7);
    assert_eq!(count_rows(&output).unwrap(), 7);
    let content = std::fs::read_to_string(&output).unwrap();
    assert_eq!(content.matches("original_question").count(), 1);
}

// =============================================================================
// Missing-value filling
// =============================================================================

const LAPTOPS: &str = "product_id,name,manufacturer,cpu,ram\n\
                       1,Asus A,ASUS,,16GB\n\
                       2,HP B,HP,i5,8GB\n\
                       3,Dell C,,i7,\n";

#[tokio::test]
async fn test_fill_missing_merges_fills() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("laptops.csv");
    write_file(&input, LAPTOPS);
    let output = dir.path().join("filled_gemini.csv");

    let answer = json!({"cpu": "i5-1235U", "ram": 8, "manufacturer": "Dell", "bogus": "x"});
    let provider = MockLlmProvider::always(&answer.to_string());
    let service = EnrichService::new(provider.clone(), fast_config());

    let summary = service
        .fill_missing(&input, &output, "product_id", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.rows_with_missing, 2);
    assert_eq!(summary.result.stats.succeeded, 2);
    assert_eq!(summary.cells_filled, 3);
    assert_eq!(provider.call_count(), 2);
    assert!(summary.fills_file.ends_with("filled_gemini.fills.csv"));

    let table = read_table(&output).unwrap();
    assert_eq!(table.headers, vec!["product_id", "name", "manufacturer", "cpu", "ram"]);
    assert_eq!(table.get(0, "cpu"), Some("i5-1235U"));
    assert_eq!(table.get(0, "ram"), Some("16GB"));
    assert_eq!(table.get(1, "cpu"), Some("i5"));
    assert_eq!(table.get(2, "manufacturer"), Some("Dell"));
    assert_eq!(table.get(2, "ram"), Some("8"));

    let prompts = provider.prompts();
    assert!(prompts.iter().any(|p| p.contains("Asus A") && p.contains("cpu")));
}

#[tokio::test]
async fn test_fill_missing_resumes_from_fills_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("laptops.csv");
    write_file(&input, LAPTOPS);
    let output = dir.path().join("filled.csv");
    let answer = json!({"cpu": "i3", "ram": "4GB", "manufacturer": "Dell"}).to_string();

    EnrichService::new(MockLlmProvider::always(&answer), fast_config())
        .fill_missing(&input, &output, "product_id", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    let second = MockLlmProvider::always(&answer);
    let summary = EnrichService::new(second.clone(), fast_config())
        .fill_missing(&input, &output, "product_id", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.call_count(), 0);
    assert_eq!(summary.result.stats.skipped_done, 2);
    assert_eq!(summary.cells_filled, 3);
}

#[tokio::test]
async fn test_fill_missing_failure_writes_no_fill() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("laptops.csv");
    write_file(&input, LAPTOPS);
    let output = dir.path().join("filled.csv");

    let service = EnrichService::new(MockLlmProvider::always("[1, 2, 3]"), fast_config());
    let summary = service
        .fill_missing(&input, &output, "product_id", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.result.stats.failed, 2);
    assert_eq!(summary.cells_filled, 0);
    assert_eq!(count_rows(&summary.fills_file).unwrap(), 0);
    assert_eq!(read_table(&output).unwrap().get(0, "cpu"), None);
}

#[tokio::test]
async fn test_fill_missing_tokens_and_shared_ids() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("laptops.csv");
    write_file(
        &input,
        "product_id,name,cpu,ram\n\
         7,Asus A,,16GB\n\
         7,Asus A,i9,16GB\n\
         5,N/A,NaN,null\n",
    );
    let output = dir.path().join("filled.csv");
    let answer = json!({"cpu": "i5", "name": "Acer Swift", "ram": "8GB"}).to_string();
    let provider = MockLlmProvider::always(&answer);

    let summary = EnrichService::new(provider.clone(), fast_config())
        .fill_missing(&input, &output, "product_id", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.rows_with_missing, 2);
    assert_eq!(summary.result.stats.skipped_done, 0);
    assert_eq!(provider.call_count(), 2);
    assert_eq!(summary.cells_filled, 4);

    let table = read_table(&output).unwrap();
    assert_eq!(table.get(0, "cpu"), Some("i5"));
    assert_eq!(table.get(1, "cpu"), Some("i9"));
    assert_eq!(table.get(2, "name"), Some("Acer Swift"));
    assert_eq!(table.get(2, "cpu"), Some("i5"));
    assert_eq!(table.get(2, "ram"), Some("8GB"));
    assert!(provider.prompts().iter().all(|p| !p.contains("- cpu: NaN")));
}

// =============================================================================
// Question generation
// =============================================================================

fn generated(n: usize) -> String {
    let items: Vec<_> = (0..n)
        .map(|i| {
            json!({
                "question": format!("Laptop nào chơi game tốt số {i}?"),
                "recommend_budget": 0,
                "recommend_usage": "1",
                "tech_detail": false
            })
        })
        .collect();
    json!({ "generated_data": items }).to_string()
}

fn laptops_csv(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("laptops.csv");
    let mut content = String::from("name,manufacturer,cpu_model,root_price\n");
    for i in 0..6 {
        content.push_str(&format!("Laptop {i},Brand {i},i{i},N/A\n"));
    }
    write_file(&path, &content);
    path
}

#[tokio::test]
async fn test_generate_reaches_target() {
    let dir = tempfile::tempdir().unwrap();
    let laptops = laptops_csv(dir.path());
    let output = dir.path().join("generated.csv");
    let provider = MockLlmProvider::always(&generated(10));
    let service = EnrichService::new(provider.clone(), fast_config());

    let plan = GenerationPlan::default()
        .with_target(25)
        .with_batch_size(10)
        .with_seed(42);
    let summary = service
        .generate_questions(&laptops, &output, &plan, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.generated, 25);
    assert_eq!(summary.rounds, 1);
    assert!(summary.reached_target());
    assert_eq!(provider.call_count(), 3);
    assert_eq!(count_rows(&output).unwrap(), 25);

    let table = read_table(&output).unwrap();
    assert_eq!(table.get(0, "recommend_usage"), Some("1"));
    assert_eq!(table.get(0, "tech_detail"), Some("0"));

    // Missing values never reach the prompt
    assert!(provider.prompts().iter().all(|p| !p.contains("N/A")));
}

#[tokio::test]
async fn test_generate_tops_up_short_batches() {
    let dir = tempfile::tempdir().unwrap();
    let laptops = laptops_csv(dir.path());
    let output = dir.path().join("generated.csv");
    let provider = MockLlmProvider::always(&generated(4));
    let service = EnrichService::new(provider, fast_config());

    let plan = GenerationPlan::default().with_target(10).with_batch_size(5).with_seed(1);
    let summary = service
        .generate_questions(&laptops, &output, &plan, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    // 8 rows in round 0, the remaining 2 in round 1
    assert_eq!(summary.rounds, 2);
    assert_eq!(summary.total(), 10);
}

#[tokio::test]
async fn test_generate_stops_when_round_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let laptops = laptops_csv(dir.path());
    let output = dir.path().join("generated.csv");
    let provider = MockLlmProvider::always(r#"{"generated_data": []}"#);
    let service = EnrichService::new(provider.clone(), fast_config());

    let plan = GenerationPlan::default().with_target(20).with_batch_size(10);
    let summary = service
        .generate_questions(&laptops, &output, &plan, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.generated, 0);
    assert_eq!(provider.call_count(), 2);
    assert!(!summary.reached_target());
}

#[tokio::test]
async fn test_generate_counts_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let laptops = laptops_csv(dir.path());
    let output = dir.path().join("generated.csv");
    write_file(
        &output,
        "\u{feff}question,recommend_budget,recommend_usage,tech_detail\n\
         a,1,0,0\nb,0,1,0\nc,0,0,1\n",
    );
    let provider = MockLlmProvider::always(&generated(10));
    let service = EnrichService::new(provider.clone(), fast_config());

    let plan = GenerationPlan::default().with_target(3);
    let summary = service
        .generate_questions(&laptops, &output, &plan, &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.existing, 3);
    assert_eq!(summary.generated, 0);
    assert_eq!(provider.call_count(), 0);
}

// =============================================================================
// Rate limiting and circuit breaker
// =============================================================================

fn server_error() -> AppError {
    AppError::LlmError(LlmErrorDetails::new(
        "mock",
        LlmErrorKind::ServerError,
        "overloaded",
        503,
    ))
}

fn tripping_config(max_attempts: u32, recovery: Duration) -> lapbot_core::EnrichConfig {
    fast_config()
        .with_concurrency(1)
        .with_retry(RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        })
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: recovery,
            ..CircuitBreakerConfig::default()
        })
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_waits_and_counts_as_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\nmáy này pin bao lâu\n");
    let output = dir.path().join("intents.csv");

    let provider = MockLlmProvider::new(|_, _| Err(server_error()));
    let reporter = RecordingReporter::default();
    let service =
        EnrichService::new(provider.clone(), tripping_config(3, Duration::from_secs(10)));

    let result = service
        .classify_intents(&input, &output, "content", &reporter, CancellationToken::new())
        .await
        .unwrap();

    // Attempt 1 fails and opens the circuit, attempt 2 waits it out,
    // attempt 3 probes the half-open circuit
    assert_eq!(provider.call_count(), 2);
    assert_eq!(reporter.count("circuit_open"), 1);
    assert_eq!(reporter.count("retry_scheduled"), 1);
    let wait = reporter.circuit_waits()[0];
    assert!(wait > Duration::from_secs(9) && wait <= Duration::from_secs(10));

    let times = provider.call_times();
    assert!(times[1] - times[0] >= Duration::from_secs(9));

    assert_eq!(result.stats.fallback, 1);
    let table = read_table(&output).unwrap();
    assert_eq!(table.get(0, "corrected_question"), Some(RETURNED_NONE_MARKER));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_on_last_attempt_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\nmàn hình có cảm ứng không\n");
    let output = dir.path().join("intents.csv");

    let provider = MockLlmProvider::new(|_, _| Err(server_error()));
    let reporter = RecordingReporter::default();
    let service =
        EnrichService::new(provider.clone(), tripping_config(2, Duration::from_secs(60)));

    let start = Instant::now();
    let result = service
        .classify_intents(&input, &output, "content", &reporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(provider.call_count(), 1);
    assert_eq!(reporter.count("circuit_open"), 1);
    assert!(start.elapsed() < Duration::from_secs(60));
    assert_eq!(result.stats.fallback, 1);
    assert_eq!(
        read_table(&output).unwrap().get(0, "corrected_question"),
        Some(RETURNED_NONE_MARKER)
    );
}

#[tokio::test(start_paused = true)]
async fn test_calls_are_spaced_by_requests_per_minute() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q.csv");
    write_file(&input, "content\ncâu 1\ncâu 2\ncâu 3\ncâu 4\n");
    let output = dir.path().join("intents.csv");

    let provider = MockLlmProvider::always(INTENT_ANSWER);
    let config = fast_config().with_concurrency(2).with_requests_per_minute(30);
    let service = EnrichService::new(provider.clone(), config);

    let result = service
        .classify_intents(&input, &output, "content", &SilentReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stats.succeeded, 4);
    let mut times = provider.call_times();
    times.sort();
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(2));
    }
    assert!(times[3] - times[0] < Duration::from_secs(7));
}
