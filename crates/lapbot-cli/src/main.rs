use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lapbot_cli::{
    Command, Config, CrawlCommand, LlmKeys, crawl_config, enrich_config, listing_urls,
    llm_config, render_missing_report, resolve_provider, tgdd_listing_url,
};
use lapbot_client::{CellphonesClient, LlmProviderEnum, TgddClient};
use lapbot_core::fill_missing::output_path_for;
use lapbot_core::table::{read_column, read_table};
use lapbot_core::traits::LlmProvider;
use lapbot_core::{
    AppError, CrawlService, CrawlStats, EnrichResult, EnrichService, EnrichStatus, FileConfig,
    FillSummary, GenerationPlan, GenerationSummary, LlmProviderType, TgddCrawler, TracingReporter,
    load_config,
};

const RULE: &str = "═══════════════════════════════════════════════════════";
const THIN_RULE: &str = "───────────────────────────────────────────────────────";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    let config = Config::parse();

    if let Err(e) = init_tracing(config.verbose) {
        eprintln!("Warning: {e:#}");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<AppError>() {
                Some(app) => eprintln!("Error: {}", app.user_message()),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// `-v`/`-vv` win over `RUST_LOG`; without them `RUST_LOG` or `info` applies.
fn init_tracing(verbose: u8) -> anyhow::Result<()> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

async fn run(config: Config) -> anyhow::Result<()> {
    let file_config = load_config(config.config.clone())?;
    let file = file_config.as_ref();

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match config.command {
        Command::Crawl { target } => {
            handle_crawl(target, file, config.concurrency, cancel).await?;
        }
        Command::FillMissing {
            input,
            output,
            model,
            key_column,
        } => {
            let provider = resolve_provider(model, file);
            let service =
                enrich_service(provider, &config.keys, file, config.concurrency, config.rpm)?;
            let output = output_path_for(&output, provider);

            info!("Filling missing values: {} -> {}", input.display(), output.display());
            let summary = service
                .fill_missing(&input, &output, &key_column, &TracingReporter, cancel)
                .await?;
            print_fill_summary(&summary);
        }
        Command::Classify {
            input,
            output,
            question_column,
            model,
        } => {
            let provider = resolve_provider(model, file);
            let service =
                enrich_service(provider, &config.keys, file, config.concurrency, config.rpm)?;

            info!("Classifying questions: {} -> {}", input.display(), output.display());
            let result = service
                .classify_intents(&input, &output, &question_column, &TracingReporter, cancel)
                .await?;
            print_enrich_summary("Intent classification", &output, &result);
        }
        Command::Generate {
            laptops,
            output,
            target,
            batch_size,
            seed,
            model,
        } => {
            let provider = resolve_provider(model, file);
            let service =
                enrich_service(provider, &config.keys, file, config.concurrency, config.rpm)?;

            let mut plan = GenerationPlan::default()
                .with_target(target)
                .with_batch_size(batch_size);
            if let Some(seed) = seed {
                plan = plan.with_seed(seed);
            }

            info!("Generating questions: {} -> {}", laptops.display(), output.display());
            let summary = service
                .generate_questions(&laptops, &output, &plan, &TracingReporter, cancel)
                .await?;
            print_generation_summary(&output, &summary);
        }
        Command::MissingReport { input, json } => {
            show_missing_report(&input, json)?;
        }
    }

    Ok(())
}

fn enrich_service(
    provider: LlmProviderType,
    keys: &LlmKeys,
    file: Option<&FileConfig>,
    concurrency: Option<usize>,
    rpm: Option<u32>,
) -> anyhow::Result<EnrichService<LlmProviderEnum>> {
    let llm = llm_config(provider, keys, file)?;
    let client = LlmProviderEnum::from_config(&llm)?;
    let enrich = enrich_config(file, concurrency, rpm);

    info!(
        provider = client.name(),
        model = client.model(),
        concurrency = enrich.concurrency,
        rpm = enrich.requests_per_minute,
        "Using LLM provider"
    );
    Ok(EnrichService::new(client, enrich))
}

async fn handle_crawl(
    target: CrawlCommand,
    file: Option<&FileConfig>,
    concurrency: Option<usize>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let reporter = TracingReporter;
    let crawl = crawl_config(file, concurrency);
    let cellphones = || -> Result<_, AppError> {
        Ok(CrawlService::new(CellphonesClient::new()?, crawl.clone()))
    };

    let (label, output, stats) = match target {
        CrawlCommand::Products { output } => {
            let stats = cellphones()?.crawl_products(&output, &reporter).await?;
            ("Products", output, stats)
        }
        CrawlCommand::Questions { output, max_pages } => {
            let stats = cellphones()?
                .crawl_questions(&output, max_pages, &reporter, cancel.clone())
                .await?;
            ("Questions", output, stats)
        }
        CrawlCommand::Addons {
            input,
            output,
            mut product_id,
        } => {
            if let Some(input) = input {
                product_id.extend(read_column(&input, "product_id")?);
            }
            info!("Collecting add-ons for {} root products", product_id.len());
            let stats = cellphones()?
                .crawl_addons(product_id, &output, &reporter, cancel.clone())
                .await?;
            ("Add-ons", output, stats)
        }
        CrawlCommand::Urls {
            output,
            listing_url,
        } => {
            let listings = listing_urls(listing_url, file);
            let stats = cellphones()?
                .collect_product_urls(&listings, &output, &reporter, cancel.clone())
                .await?;
            ("Product urls", output, stats)
        }
        CrawlCommand::Variants { input, output } => {
            let urls = read_column(&input, "url")?;
            info!("Crawling variants from {} urls", urls.len());
            let stats = cellphones()?
                .crawl_variants(urls, &output, &reporter, cancel.clone())
                .await?;
            ("Variants", output, stats)
        }
        CrawlCommand::Tgdd {
            output_dir,
            listing_url,
            pending_only,
        } => {
            let crawler = TgddCrawler::new(TgddClient::new()?, crawl.clone());
            let listing = tgdd_listing_url(listing_url, file);
            let listing = (!pending_only).then_some(listing.as_str());
            info!("Saving thegioididong page sources to {}", output_dir.display());
            let stats = crawler
                .crawl(listing, &output_dir, &reporter, cancel.clone())
                .await?;
            ("thegioididong", output_dir, stats)
        }
    };

    print_crawl_summary(label, &output, &stats, cancel.is_cancelled());
    Ok(())
}

/// Wait for Ctrl+C and cancel the running job.
async fn shutdown_signal(cancel: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupt received, finishing in-flight work...");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
    }
}

// =============================================================================
// Summaries
// =============================================================================

fn print_resume_hint(cancelled: bool) {
    if cancelled {
        info!("Interrupted. Re-run the same command to resume.");
    }
}

fn print_crawl_summary(label: &str, output: &Path, stats: &CrawlStats, cancelled: bool) {
    info!("");
    info!("{RULE}");
    info!("{} crawl complete: {}", label, output.display());
    info!("{RULE}");
    info!("  Pages fetched:       {}", stats.pages);
    info!("  Rows written:        {}", stats.records);
    info!("  Skipped:             {}", stats.skipped);
    info!("  Failed:              {}", stats.failed);
    info!("{RULE}");
    print_resume_hint(cancelled);
}

fn print_enrich_summary(label: &str, output: &Path, result: &EnrichResult) {
    let stats = &result.stats;
    info!("");
    info!("{RULE}");
    info!("{} {}: {}", label, result.status.as_str(), output.display());
    info!("{RULE}");
    info!("  + Succeeded:         {}", stats.succeeded);
    info!("  ~ Fallback:          {}", stats.fallback);
    info!("  ✗ Failed:            {}", stats.failed);
    info!("  = Already done:      {}", stats.skipped_done);
    info!("  - Empty input:       {}", stats.skipped_empty);
    info!("{THIN_RULE}");
    info!("  Rows written:        {}", stats.rows_written);
    info!("  Elapsed:             {:.1}s", result.elapsed().as_secs_f64());
    info!("{RULE}");

    if stats.failed > 0 {
        info!("Failed items are retried on the next run.");
    }
    print_resume_hint(result.is_cancelled());
}

fn print_fill_summary(summary: &FillSummary) {
    print_enrich_summary("Fill missing", &summary.output, &summary.result);
    info!("  Rows with gaps:      {}", summary.rows_with_missing);
    info!("  Cells filled:        {}", summary.cells_filled);
    info!("  Fills kept in:       {}", summary.fills_file.display());
}

fn print_generation_summary(output: &Path, summary: &GenerationSummary) {
    info!("");
    info!("{RULE}");
    info!("Question generation {}: {}", summary.status.as_str(), output.display());
    info!("{RULE}");
    info!("  Target rows:         {}", summary.target);
    info!("  Existing rows:       {}", summary.existing);
    info!("  Generated:           {}", summary.generated);
    info!("  Rounds:              {}", summary.rounds);
    info!("  Failed calls:        {}", summary.stats.failed);
    info!("{THIN_RULE}");
    info!("  Total rows:          {}", summary.total());
    info!("{RULE}");

    if !summary.reached_target() && summary.status != EnrichStatus::Cancelled {
        warn!(
            "Target not reached ({} of {}); re-run to top up.",
            summary.total(),
            summary.target
        );
    }
}

fn show_missing_report(input: &Path, json: bool) -> anyhow::Result<()> {
    let table = read_table(input)?;
    println!("{}", render_missing_report(input, &table, json)?);
    Ok(())
}
