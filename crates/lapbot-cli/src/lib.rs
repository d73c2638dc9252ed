use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use clap::{Args, Parser, Subcommand};
use lapbot_client::LlmConfig;
use lapbot_core::cleaning::incomplete_columns;
use lapbot_core::tgdd::DEFAULT_TGDD_LISTING_URL;
use lapbot_core::{
    AppError, CircuitBreakerConfig, CrawlConfig, EnrichConfig, FileConfig, LlmProviderType,
    MissingColumn, Table, missing_report,
};

/// Listing page scanned when neither flags nor the config file name one.
pub const DEFAULT_LISTING_URL: &str = "https://cellphones.com.vn/laptop.html";

static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION");

    let commit = option_env!("VERGEN_GIT_SHA")
        .map(|s| s.chars().take(7).collect::<String>())
        .unwrap_or_else(|| "unknown".to_string());

    let built = option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"); // YYYY-MM-DD
    let target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown");
    let rustc = option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown");

    format!("{version}\ncommit: {commit}\nbuilt: {built}\ntarget: {target}\nrustc: {rustc}")
});

pub fn version_info() -> &'static str {
    &VERSION_INFO
}

fn parse_provider(s: &str) -> Result<LlmProviderType, String> {
    s.parse().map_err(|e: AppError| e.to_string())
}

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "lapbot")]
#[command(
    author,
    version = version_info(),
    about = "Crawlers and LLM enrichment pipelines for a laptop question dataset"
)]
#[command(after_help = "Examples:
  lapbot crawl products --output data/products.csv
  lapbot crawl questions --output data/questions.csv --max-pages 50
  lapbot crawl tgdd --output-dir data/thegioididong
  lapbot fill-missing --input data/products.csv --output data/filled.csv --model llama
  lapbot classify --input data/questions.csv --output data/intents.csv
  lapbot generate --laptops data/filled_gemini.csv --output data/generated.csv --target 500

Interrupted runs resume from their output file: re-run the same command.")]
pub struct Config {
    /// Custom path to lapbot.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Concurrent LLM calls, or concurrent page fetches for `crawl variants`
    #[arg(long, global = true, env = "LLM_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// LLM requests per minute (0 disables the limit)
    #[arg(long, global = true, env = "LLM_REQUESTS_PER_MINUTE")]
    pub rpm: Option<u32>,

    #[command(flatten)]
    pub keys: LlmKeys,

    #[command(subcommand)]
    pub command: Command,
}

/// Credentials and model overrides for the LLM providers.
#[derive(Args, Debug, Clone, Default)]
pub struct LlmKeys {
    /// Google API key for Gemini
    #[arg(long, global = true, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub google_api_key: Option<String>,

    /// Together API key for Llama
    #[arg(long, global = true, env = "TOGETHER_API_KEY", hide_env_values = true)]
    pub together_api_key: Option<String>,

    /// Gemini model name
    #[arg(long, global = true, env = "GEMINI_MODEL")]
    pub gemini_model: Option<String>,

    /// Together model name
    #[arg(long, global = true, env = "TOGETHER_MODEL")]
    pub together_model: Option<String>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl the CellphoneS catalog or thegioididong page sources
    Crawl {
        #[command(subcommand)]
        target: CrawlCommand,
    },
    /// Fill empty cells of a product table with an LLM
    #[command(after_help = "The output name gets a provider suffix:
  --output filled.csv --model gemini  ->  filled_gemini.csv")]
    FillMissing {
        /// Product table to complete
        #[arg(short, long, env = "INPUT_FILE_PATH")]
        input: PathBuf,
        /// Completed table (suffixed with the provider)
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
        /// LLM provider: gemini or llama
        #[arg(short, long, value_parser = parse_provider)]
        model: Option<LlmProviderType>,
        /// Column identifying a row across runs
        #[arg(long, default_value = "product_id")]
        key_column: String,
    },
    /// Clean customer questions and assign intent ids
    Classify {
        /// Question table
        #[arg(short, long, env = "INPUT_FILE_PATH")]
        input: PathBuf,
        /// Classified questions
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
        /// Column holding the question text
        #[arg(long, default_value = "content")]
        question_column: String,
        /// LLM provider: gemini or llama
        #[arg(short, long, value_parser = parse_provider)]
        model: Option<LlmProviderType>,
    },
    /// Generate labelled questions about sampled laptops
    Generate {
        /// Laptop table (product_id, name and specification columns)
        #[arg(short, long, env = "INPUT_FILE_PATH")]
        laptops: PathBuf,
        /// Generated questions
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
        /// Total rows wanted in the output file
        #[arg(long, default_value = "2000")]
        target: usize,
        /// Questions requested per call
        #[arg(long, default_value = "10")]
        batch_size: usize,
        /// Seed for laptop sampling
        #[arg(long)]
        seed: Option<u64>,
        /// LLM provider: gemini or llama
        #[arg(short, long, value_parser = parse_provider)]
        model: Option<LlmProviderType>,
    },
    /// Show the share of empty cells per column
    MissingReport {
        /// Table to inspect
        #[arg(short, long, env = "INPUT_FILE_PATH")]
        input: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// `lapbot crawl` targets
#[derive(Subcommand, Debug)]
pub enum CrawlCommand {
    /// Every laptop with its specification attributes
    Products {
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
    },
    /// Customer questions and answers from the laptop page
    Questions {
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Accessories recommended for each laptop
    Addons {
        /// Table with a product_id column
        #[arg(short, long, env = "INPUT_FILE_PATH", required_unless_present = "product_id")]
        input: Option<PathBuf>,
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
        /// Root product id, repeatable
        #[arg(long)]
        product_id: Vec<String>,
    },
    /// Product page links from category listings
    Urls {
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
        /// Listing page, repeatable
        #[arg(long)]
        listing_url: Vec<String>,
    },
    /// Colour and configuration variants from product pages
    Variants {
        /// Table with a url column
        #[arg(short, long, env = "INPUT_FILE_PATH")]
        input: PathBuf,
        #[arg(short, long, env = "OUTPUT_FILE_PATH")]
        output: PathBuf,
    },
    /// Page sources of every thegioididong laptop, one file per colour
    #[command(after_help = "Writes crawled_status.csv, color_pages.csv and page_source/ \
under the output directory. Re-running retries the links still pending.")]
    Tgdd {
        /// Directory for the status files and saved pages
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Listing page to discover links from
        #[arg(long)]
        listing_url: Option<String>,
        /// Skip discovery and only retry links left pending
        #[arg(long)]
        pending_only: bool,
    },
}

// =============================================================================
// Settings resolution: defaults -> lapbot.toml -> environment / flags
// =============================================================================

/// Enrichment settings from the config file and the global flags.
pub fn enrich_config(
    file: Option<&FileConfig>,
    concurrency: Option<usize>,
    rpm: Option<u32>,
) -> EnrichConfig {
    let mut config = EnrichConfig {
        circuit_breaker: CircuitBreakerConfig::from_env(),
        ..EnrichConfig::default()
    };
    if let Some(file) = file {
        config = file.enrich.apply(config);
    }
    if let Some(n) = concurrency {
        config = config.with_concurrency(n);
    }
    if let Some(rpm) = rpm {
        config = config.with_requests_per_minute(rpm);
    }
    config
}

/// Crawl settings from the config file and the global `--concurrency`.
pub fn crawl_config(file: Option<&FileConfig>, concurrency: Option<usize>) -> CrawlConfig {
    let config = file
        .map(|f| f.crawl.to_crawl_config())
        .unwrap_or_default();
    match concurrency {
        Some(n) => config.with_concurrency(n),
        None => config,
    }
}

/// Provider from the flag, then the config file, then Gemini.
pub fn resolve_provider(
    flag: Option<LlmProviderType>,
    file: Option<&FileConfig>,
) -> LlmProviderType {
    flag.or_else(|| file.and_then(|f| f.llm.provider))
        .unwrap_or_default()
}

/// Provider settings with the matching key and model.
pub fn llm_config(
    provider: LlmProviderType,
    keys: &LlmKeys,
    file: Option<&FileConfig>,
) -> Result<LlmConfig, AppError> {
    let llm = file.map(|f| &f.llm);
    let (key, model, var) = match provider {
        LlmProviderType::Gemini => (
            keys.google_api_key.clone(),
            keys.gemini_model
                .clone()
                .or_else(|| llm.and_then(|l| l.gemini_model.clone())),
            "GOOGLE_API_KEY",
        ),
        LlmProviderType::Together => (
            keys.together_api_key.clone(),
            keys.together_model
                .clone()
                .or_else(|| llm.and_then(|l| l.together_model.clone())),
            "TOGETHER_API_KEY",
        ),
    };

    let key = key.filter(|k| !k.trim().is_empty()).ok_or_else(|| {
        AppError::ConfigError(format!("{var} is not set. Add it to .env or the environment"))
    })?;

    Ok(LlmConfig::new(provider, key).with_model(model))
}

/// Listing pages from the flags, then the config file, then the laptop
/// category.
pub fn listing_urls(flags: Vec<String>, file: Option<&FileConfig>) -> Vec<String> {
    if !flags.is_empty() {
        return flags;
    }
    match file {
        Some(f) if !f.crawl.listing_urls.is_empty() => f.crawl.listing_urls.clone(),
        _ => vec![DEFAULT_LISTING_URL.to_string()],
    }
}

/// thegioididong listing from the flag, then the config file, then the
/// laptop category.
pub fn tgdd_listing_url(flag: Option<String>, file: Option<&FileConfig>) -> String {
    flag.or_else(|| file.and_then(|f| f.crawl.tgdd_listing_url.clone()))
        .unwrap_or_else(|| DEFAULT_TGDD_LISTING_URL.to_string())
}

/// Columns of `table` that have missing values, as a text table or JSON.
pub fn render_missing_report(input: &Path, table: &Table, json: bool) -> anyhow::Result<String> {
    let report = missing_report(table);
    let incomplete: Vec<&MissingColumn> = incomplete_columns(&report).collect();

    if json {
        return Ok(serde_json::to_string_pretty(&incomplete)?);
    }

    let mut out = String::new();
    writeln!(out, "\nMissing values in {} ({} rows)\n", input.display(), table.len())?;
    if incomplete.is_empty() {
        writeln!(out, "  No missing values.")?;
    }
    for column in incomplete {
        writeln!(
            out,
            "  {:<40} {:>7} {:>7.2}%",
            column.column, column.missing, column.percent
        )?;
    }
    Ok(out)
}
