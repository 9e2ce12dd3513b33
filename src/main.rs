//! astack CLI - resumable element-wise function application into typed arrays.

use anyhow::{Context, Result, bail};
use astack::pipeline::load_items;
use astack::{ApplyOptions, Applicator, ArrayStore, Config, DirStore, FunctionRegistry};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "astack")]
#[command(version)]
#[command(about = "Apply functions over a sequence into resumable typed on-disk arrays")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "astack.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the configured functions to every item of a JSONL file
    Apply {
        /// Path to input items JSONL file
        #[arg(short, long)]
        input: PathBuf,

        /// Store directory (overrides [store].path)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Recreate existing arrays instead of resuming them
        #[arg(long)]
        overwrite: bool,

        /// Do not draw a progress bar
        #[arg(long)]
        no_progress: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List arrays in a store
    Inspect {
        /// Store directory (overrides [store].path)
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Print array elements as JSON lines
    Read {
        /// Array name
        #[arg(short, long)]
        name: String,

        /// Store directory (overrides [store].path)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// First index to print
        #[arg(long, default_value = "0")]
        start: u64,

        /// Number of elements to print (default: to the end)
        #[arg(long)]
        count: Option<u64>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a tracing subscriber is already installed");
    }
}

fn print_example_config(registry: &FunctionRegistry) {
    let example = r#"# astack configuration file

[store]
# Store directory, ${ENV_VAR} placeholders are expanded
path = "output/astack_store"
chunk_len = 1024
# max_len = 100000  # growth bound for new arrays (unbounded when absent)

[run]
append = true     # resume existing arrays; false recreates them
progress = true

# One [[functions]] entry per output array, applied in this order.
[[functions]]
name = "text_len"
function = "len"
dtype = "uint32"
kwargs = { field = "text" }

[[functions]]
name = "digit_runs"
function = "matches"
dtype = "uint16"
kwargs = { field = "text", pattern = '\d+' }

[[functions]]
name = "embedding"
function = "field"
dtype = "float32"
shape = [3]
kwargs = { field = "embedding" }
"#;
    println!("{example}");
    println!("# Built-in functions: {}", registry.names().join(", "));
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

/// Store directory from the CLI flag, else from the config file.
fn resolve_store(config_path: &Path, store: Option<PathBuf>) -> Result<PathBuf> {
    match store {
        Some(path) => Ok(path),
        None => Ok(load_config(config_path)?.store_path()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let registry = FunctionRegistry::new();

    match cli.command {
        Commands::Example => {
            print_example_config(&registry);
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            registry
                .specs(&config)
                .context("Invalid function definitions")?;

            info!("Configuration is valid");
            info!("  Store: {:?}", config.store_path());
            info!("  Append: {}", config.run.append);
            for function in &config.functions {
                info!(
                    "  {} = {}({}) as {}{:?}",
                    function.name,
                    function.function,
                    serde_json::to_string(&function.kwargs)?,
                    function.dtype,
                    function.shape
                );
            }
        }

        Commands::Apply {
            input,
            store,
            overwrite,
            no_progress,
            json,
        } => {
            let config = load_config(&cli.config)?;
            let defs = registry
                .specs(&config)
                .context("Invalid function definitions")?;
            let items = load_items(&input)
                .with_context(|| format!("Failed to load items from {input:?}"))?;

            let store_path = store.unwrap_or_else(|| config.store_path());
            let mut array_store = DirStore::open(&store_path)
                .with_context(|| format!("Failed to open store at {store_path:?}"))?;

            let options = ApplyOptions {
                append: config.run.append && !overwrite,
                progress: config.run.progress && !no_progress,
                chunk_len: config.store.chunk_len,
                max_len: config.store.max_len,
            };

            let stats = Applicator::new(&mut array_store)
                .with_options(options)
                .run(&items, &defs)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            println!("\n=== Application Complete ===");
            println!("Items:       {}", stats.total_items);
            println!("Resumed at:  {}", stats.start_index);
            println!("Computed:    {}", stats.computed);
            println!("Skipped:     {}", stats.skipped);
            println!("Throughput:  {:.1}/s", stats.items_per_sec);
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            for (name, processed) in &stats.watermarks {
                println!("  {name:<20} processed = {processed}");
            }
            println!("Store:       {store_path:?}");
        }

        Commands::Inspect { store } => {
            let store_path = resolve_store(&cli.config, store)?;
            if !store_path.exists() {
                bail!("No store at {store_path:?}");
            }
            let array_store = DirStore::open(&store_path)?;

            println!(
                "{:<24} {:<10} {:<10} {:>10} {:>10}",
                "NAME", "DTYPE", "SHAPE", "LEN", "PROCESSED"
            );
            for name in array_store.names()? {
                let info = array_store.info(&name)?;
                println!(
                    "{:<24} {:<10} {:<10} {:>10} {:>10}",
                    info.name,
                    info.dtype.to_string(),
                    format!("{:?}", info.item_shape),
                    info.len,
                    info.processed
                );
            }
        }

        Commands::Read {
            name,
            store,
            start,
            count,
        } => {
            let store_path = resolve_store(&cli.config, store)?;
            let array_store = DirStore::open(&store_path)?;
            let info = array_store
                .info(&name)
                .with_context(|| format!("No array named '{name}' in {store_path:?}"))?;

            let end = match count {
                Some(count) => start.saturating_add(count).min(info.len),
                None => info.len,
            };
            for index in start..end {
                let value = array_store.read(&name, index)?;
                println!("{}", serde_json::to_string(&value.to_json())?);
            }
        }
    }

    Ok(())
}
