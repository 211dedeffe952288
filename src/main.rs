//! geobatch CLI
//!
//! Copy, filter and reshape tabular/spatial datasets in parallel chunks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use geobatch::drivers::DriverOptions;
use geobatch::io::{dataset_info, info_batch};
use geobatch::{copy_dataset, points_dataset, ChunkedWriter, Config, DriverRegistry};

#[derive(Parser)]
#[command(name = "geobatch")]
#[command(about = "Stream tabular and spatial datasets through a parallel batch pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override number of worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Override records per batch
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a dataset, optionally keeping records that intersect another dataset's geometries
    Copy {
        source: String,

        /// Dataset whose geometries filter the source (one pass per geometry)
        #[arg(long)]
        filter: Option<String>,

        /// Leading batches to discard
        #[arg(long)]
        skip: Option<usize>,

        output: String,
    },

    /// Build point geometries from longitude/latitude columns
    Points {
        source: String,

        #[arg(long)]
        lon: String,

        #[arg(long)]
        lat: String,

        output: String,
    },

    /// Summarize datasets (use `-` as output to print JSON to stdout)
    Info {
        #[arg(required = true)]
        sources: Vec<String>,

        output: String,
    },

    /// Generate a default configuration file
    GenerateConfig {
        #[arg(default_value = "geobatch.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config)?;

    let registry = DriverRegistry::with_defaults()?;

    match cli.command {
        Commands::Copy {
            source,
            filter,
            skip,
            output,
        } => {
            let mut config = config;
            if let Some(skip) = skip {
                config.reader.skip = skip;
            }
            let stats = copy_dataset(&config, &registry, &source, &output, filter.as_deref())?;
            println!("{}", stats);
        }

        Commands::Points {
            source,
            lon,
            lat,
            output,
        } => {
            let stats = points_dataset(&config, &registry, &source, &lon, &lat, &output)?;
            println!("{}", stats);
        }

        Commands::Info { sources, output } => {
            info_command(&config, &registry, &sources, &output)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(&output)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(workers) = cli.workers {
        config.pipeline.workers = Some(workers);
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.reader.chunk_size = chunk_size;
    }
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Console logging, plus a verbose file log in debug mode.
fn init_logging(config: &Config) -> Result<()> {
    let console = fmt::layer().with_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()));

    let debug_file = if config.debug.enabled {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.debug.log_path)
            .with_context(|| format!("Failed to open debug log {}", config.debug.log_path.display()))?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(console).with(debug_file).init();
    if config.debug.enabled {
        tracing::info!("Debug mode: verbose log at {}", config.debug.log_path.display());
    }
    Ok(())
}

fn info_command(config: &Config, registry: &DriverRegistry, sources: &[String], output: &str) -> Result<()> {
    let infos = dataset_info(registry, sources, &config.pool_options())?;

    if output == "-" {
        let found: Vec<_> = infos.iter().flatten().collect();
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    let mut writer = ChunkedWriter::open(registry, output, &DriverOptions::default())?;
    writer.write(info_batch(&infos))?;
    writer.close()?;
    println!("Wrote info for {} datasets to {}", writer.records_written(), output);
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    let yaml = format!(
        "# geobatch configuration\n\
         # Worker count defaults to available cores minus pipeline.reserve_cores.\n\
         # Set GEOBATCH_DEBUG=1 to enable debug mode without editing this file.\n\n{}",
        Config::default().to_yaml()?
    );
    std::fs::write(output, yaml)?;
    println!("Generated configuration at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_copy() {
        let cli = Cli::try_parse_from(["geobatch", "--workers", "3", "copy", "a.csv", "--skip", "2", "b.geojson"])
            .unwrap();
        assert_eq!(cli.workers, Some(3));
        match cli.command {
            Commands::Copy { source, skip, output, filter } => {
                assert_eq!(source, "a.csv");
                assert_eq!(skip, Some(2));
                assert_eq!(output, "b.geojson");
                assert!(filter.is_none());
            }
            _ => panic!("expected copy"),
        }
    }

    #[test]
    fn test_cli_parse_info_many_sources() {
        let cli = Cli::try_parse_from(["geobatch", "info", "a.csv", "b.sqlite:roads", "-"]).unwrap();
        match cli.command {
            Commands::Info { sources, output } => {
                assert_eq!(sources, vec!["a.csv", "b.sqlite:roads"]);
                assert_eq!(output, "-");
            }
            _ => panic!("expected info"),
        }
    }

    #[test]
    fn test_cli_requires_output() {
        assert!(Cli::try_parse_from(["geobatch", "points", "a.csv", "--lon", "x", "--lat", "y"]).is_err());
    }

    #[test]
    fn test_generated_config_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("geobatch.yaml");
        generate_config_command(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
    }
}
