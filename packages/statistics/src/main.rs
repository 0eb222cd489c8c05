#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the census statistics pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use census_map_catalog::Catalog;
use census_map_catalog::builder::{DEFAULT_GEO_LEVEL as CATALOG_GEO_LEVEL, build_from_csv};
use census_map_catalog::prune::prune_files;
use census_map_cli_utils::{IndicatifProgress, MultiProgress, init_logger};
use census_map_staging::StagingBackend;
use census_map_staging::snapshot::load_snapshot;
use census_map_statistics::filter::RowFilter;
use census_map_statistics::pipeline::{PipelineProgress, input_files, ranges_from_snapshot};
use census_map_statistics::verify::verify_files;
use census_map_statistics::{StatisticsConfig, StatsError, run_with_store};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "census_map_statistics", about = "Census statistics pipeline")]
struct Cli {
    /// TOML configuration file (overrides `CENSUS_MAP_CONFIG`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage every census file in two passes and write attribute ranges
    Run {
        #[command(flatten)]
        inputs: InputArgs,
        /// Output path of the ranges artifact
        #[arg(long)]
        output: Option<PathBuf>,
        /// Maximum number of in-flight row handlers
        #[arg(long)]
        concurrency: Option<usize>,
        /// Records per Phase FINAL batch lookup
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stage values in a `DuckDB` file instead of memory
        /// (defaults to `data/staging.duckdb`)
        #[arg(long, value_name = "PATH", num_args = 0..=1)]
        duckdb: Option<Option<PathBuf>>,
        /// Export the staged values to this CSV after the run
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Recompute attribute ranges from an exported snapshot
    Ranges {
        /// Snapshot CSV written by `run --snapshot`
        #[arg(long)]
        snapshot: PathBuf,
        /// Attribute catalog JSON
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Output path of the ranges artifact
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check that every relevant record has a staged value
    Verify {
        #[command(flatten)]
        inputs: InputArgs,
        /// Snapshot CSV to check (defaults to the configured `DuckDB` store)
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Build, prune, or inspect the attribute catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Derive the catalog from the characteristic hierarchy of a census file
    Build {
        /// Census CSV to read
        #[arg(long)]
        source: PathBuf,
        /// Geography level whose rows define the hierarchy
        #[arg(long, default_value = CATALOG_GEO_LEVEL)]
        geo_level: String,
        /// Output path (defaults to the configured catalog path)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove attributes whose counts are zero across all relevant rows
    Prune {
        #[command(flatten)]
        inputs: InputArgs,
        /// Output path (defaults to overwriting the input catalog)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print categories and attributes
    List {
        /// Attribute catalog JSON
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

/// Input selection shared by the commands that read census files.
#[derive(Args)]
struct InputArgs {
    /// Directory holding the census extracts
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// File name fragment selecting input files
    #[arg(long)]
    pattern: Option<String>,
    /// Attribute catalog JSON
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Geography level of relevant rows (e.g. "Dissemination area")
    #[arg(long)]
    geo_level: Option<String>,
}

impl InputArgs {
    fn apply(self, config: &mut StatisticsConfig) {
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(pattern) = self.pattern {
            config.file_pattern = pattern;
        }
        if let Some(catalog) = self.catalog {
            config.catalog_path = catalog;
        }
        if let Some(geo_level) = self.geo_level {
            config.geo_level = geo_level;
        }
    }
}

fn progress(multi: &MultiProgress) -> PipelineProgress {
    PipelineProgress {
        records: IndicatifProgress::records(multi, "Staging census values"),
        attributes: IndicatifProgress::attributes(multi, "Computing ranges"),
    }
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = init_logger();
    let cli = Cli::parse();
    let mut config = StatisticsConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            inputs,
            output,
            concurrency,
            batch_size,
            duckdb,
            snapshot,
        } => {
            inputs.apply(&mut config);
            if let Some(output) = output {
                config.ranges_path = output;
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(batch_size) = batch_size {
                config.lookup_batch_size = batch_size;
            }
            if let Some(path) = duckdb {
                config.use_duckdb(path);
            }
            if snapshot.is_some() {
                config.snapshot_path = snapshot;
            }
            config.validate()?;

            let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
            let summary = run_with_store(&config, catalog, &progress(&multi)).await?;

            println!(
                "{} file(s), {} attribute(s) with data, {} without, {:.1}s",
                summary.files.len(),
                summary.attributes_with_data,
                summary.attributes_without_data,
                summary.duration.as_secs_f64()
            );
            println!("Ranges written to {}", config.ranges_path.display());
        }
        Commands::Ranges {
            snapshot,
            catalog,
            output,
        } => {
            let catalog_path = catalog.unwrap_or(config.catalog_path);
            let ranges_path = output.unwrap_or(config.ranges_path);
            let catalog = Catalog::load(&catalog_path)?;

            let ranges =
                ranges_from_snapshot(&snapshot, &catalog, &ranges_path, &progress(&multi)).await?;

            println!(
                "{} attribute range(s) written to {}",
                ranges.len(),
                ranges_path.display()
            );
        }
        Commands::Verify { inputs, snapshot } => {
            inputs.apply(&mut config);
            config.validate()?;

            let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
            let files = input_files(&config)?;
            let filter = RowFilter::new(config.geo_level.clone(), catalog);

            let store: Arc<dyn census_map_staging::StagingStore> = match snapshot {
                Some(path) => Arc::new(load_snapshot(&path).await?),
                None if matches!(config.staging, StagingBackend::Duckdb { .. }) => {
                    census_map_staging::open(&config.staging).await?
                }
                None => {
                    return Err(StatsError::Config(
                        "verify needs --snapshot or a duckdb staging backend".to_string(),
                    )
                    .into());
                }
            };

            let report = verify_files(
                &files,
                &filter,
                store.as_ref(),
                config.encoding,
                config.lookup_batch_size,
            )
            .await;
            store.close().await?;
            let report = report?;

            for key in &report.missing {
                println!("missing {key}");
            }
            println!(
                "{} key(s) checked, {} missing",
                report.checked,
                report.missing.len()
            );

            if !report.is_complete() {
                std::process::exit(1);
            }
        }
        Commands::Catalog { command } => match command {
            CatalogCommands::Build {
                source,
                geo_level,
                output,
            } => {
                let output = output.unwrap_or(config.catalog_path);
                let catalog = build_from_csv(&source, &geo_level, config.encoding)?;
                catalog.save(&output)?;
                println!(
                    "{} attribute(s) in {} categories written to {}",
                    catalog.len(),
                    catalog.categories().len(),
                    output.display()
                );
            }
            CatalogCommands::Prune { inputs, output } => {
                inputs.apply(&mut config);
                let catalog = Catalog::load(&config.catalog_path)?;
                let files = input_files(&config)?;

                let (pruned, report) =
                    prune_files(&catalog, &files, &config.geo_level, config.encoding)?;

                let output = output.unwrap_or(config.catalog_path);
                pruned.save(&output)?;
                println!(
                    "Removed {} attribute(s), kept {} as divisors, {} remain in {}",
                    report.removed.len(),
                    report.kept_as_divisor.len(),
                    pruned.len(),
                    output.display()
                );
            }
            CatalogCommands::List { catalog } => {
                let catalog = Catalog::load(&catalog.unwrap_or(config.catalog_path))?;
                for category in catalog.categories() {
                    println!("{}", category.name);
                    for attribute in &category.attributes {
                        match attribute.effective_divisor() {
                            Some(divisor) => println!(
                                "  {:>6}  {} (÷ {divisor})",
                                attribute.id, attribute.name
                            ),
                            None => println!("  {:>6}  {}", attribute.id, attribute.name),
                        }
                    }
                }
            }
        },
    }

    Ok(())
}
