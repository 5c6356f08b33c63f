//! distillery CLI - Inspect and validate a distillation log root.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use distillery::models::DatasetKind;
use distillery::storage::LoadMode;
use distillery::{Config, FilesystemAdapter, PersistenceAdapter, ProviderRegistry};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "distillery")]
#[command(author = "Infernet <dev@infernet.org>")]
#[command(version)]
#[command(about = "Adaptive teacher-to-student distillation for LLM-backed functions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "distillery.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file and provider credentials
    Validate,

    /// Show example configuration
    Example,

    /// Show the persisted config and dataset sizes of one function
    Status {
        /// Function hash
        hash: String,
    },

    /// List every function with stored datasets
    Datasets,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# distillery configuration file

[storage]
dir = ".distillery"
bloom_expected_items = 10000
bloom_false_positive_rate = 0.01

[distillation]
environment_id = 0
base_threshold = 200        # datapoints before the first fine-tune, doubles per run
poll_interval_mins = 30
prompt_token_budget = 1000  # token budget for prompt examples
example_buffer_bytes = 4096
student = { model_name = "gpt-3.5-turbo-1106", provider = "openai", context_length = 14000 }
teachers = [
    { model_name = "gpt-4", provider = "openai", context_length = 8192 },
    { model_name = "gpt-4-32k", provider = "openai", context_length = 32768 },
]

[providers.openai]
# API key (can also use OPENAI_API_KEY env var)
# api_key = "${OPENAI_API_KEY}"
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
timeout_secs = 180
max_retries = 3
"#;
    println!("{example}");
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match &cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli)?;
            config.validate().context("Invalid configuration")?;

            let providers =
                ProviderRegistry::from_config(&config).context("Failed to set up providers")?;

            info!("Configuration is valid");
            info!("  Storage: {}", config.storage.dir.display());
            info!(
                "  Student: {} ({})",
                config.distillation.student.model_name, config.distillation.student.provider
            );
            info!(
                "  Teachers: {}",
                config
                    .distillation
                    .teachers
                    .iter()
                    .map(|t| t.model_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            info!("  Providers: {}", providers.names().join(", "));
            info!(
                "  First fine-tune after {} datapoints",
                config.distillation.base_threshold
            );
        }

        Commands::Status { hash } => {
            let config = load_config(&cli)?;
            let adapter =
                FilesystemAdapter::open(&config.storage).context("Failed to open storage")?;

            match adapter
                .config_store()
                .read(hash)
                .context("Failed to read function config")?
            {
                Some(function_config) => {
                    println!("{}", serde_json::to_string_pretty(&function_config)?);
                    println!(
                        "\nNext fine-tune after: {} datapoints",
                        function_config.finetune_threshold(config.distillation.base_threshold)
                    );
                }
                None => println!("No config recorded for {hash}"),
            }

            println!("\n=== Datasets ===");
            for kind in DatasetKind::ALL {
                let loaded = adapter
                    .load_dataset(kind, hash, LoadMode::Length)
                    .with_context(|| format!("Failed to read {kind} dataset"))?;
                println!("{:<12} {}", kind.to_string(), loaded.length.unwrap_or_default());
            }
        }

        Commands::Datasets => {
            let config = load_config(&cli)?;
            let mut adapter =
                FilesystemAdapter::open(&config.storage).context("Failed to open storage")?;
            let index = adapter
                .load_existing_datasets()
                .context("Failed to scan datasets")?;

            let configs = adapter.config_store();
            let mut functions = index.functions();
            functions.extend(configs.list().context("Failed to list function configs")?);
            functions.sort();
            functions.dedup();

            if functions.is_empty() {
                println!("No datasets in {}", adapter.dir().display());
                return Ok(());
            }

            println!(
                "{:<34} {:>10} {:>10} {:>10} {:>10} {:>7}",
                "function", "aligned", "positive", "negative", "patches", "config"
            );
            for func_hash in &functions {
                let size = |kind| index.get(kind, func_hash).unwrap_or_default();
                println!(
                    "{:<34} {:>10} {:>10} {:>10} {:>10} {:>7}",
                    func_hash,
                    size(DatasetKind::SymbolicAlignment),
                    size(DatasetKind::PositiveEmbedding),
                    size(DatasetKind::NegativeEmbedding),
                    size(DatasetKind::Patch),
                    if configs.exists(func_hash) { "yes" } else { "no" },
                );
            }
        }
    }

    Ok(())
}
