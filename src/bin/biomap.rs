//! biomap CLI - above-ground biomass mapping

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use biomap::core::terrain::TerrainAnalyzer;
use biomap::core::tiling::TiledRetriever;
use biomap::io::raster::{read_geotiff, write_geotiff};
use biomap::{BoundingBox, HttpTileSource, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "biomap")]
#[command(author, version, about = "Above-ground biomass mapping", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full workflow from a JSON configuration
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a default configuration to start from
    InitConfig {
        /// Output file
        #[arg(default_value = "biomap.json")]
        output: PathBuf,
    },
    /// Retrieve one band from a remote export service in tiles
    Fetch {
        /// Export service URL
        #[arg(long)]
        endpoint: String,
        /// Image or composite identifier on the service
        #[arg(long)]
        image: String,
        /// Band name
        #[arg(long)]
        band: String,
        /// Bounding box as min_lon,min_lat,max_lon,max_lat
        #[arg(long, value_delimiter = ',', num_args = 4, allow_negative_numbers = true)]
        bbox: Vec<f64>,
        /// Pixel size in meters
        #[arg(short, long, default_value = "100")]
        scale: f64,
        /// Tiles per side
        #[arg(short, long, default_value = "4")]
        grid: usize,
        /// Pause between requests in milliseconds
        #[arg(long, default_value = "1000")]
        pause_ms: u64,
        /// Output GeoTIFF
        output: PathBuf,
    },
    /// Slope in degrees from a DEM
    Slope {
        /// Input DEM file
        input: PathBuf,
        /// Output file
        output: PathBuf,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run { config } => {
            let config = PipelineConfig::from_file(&config)
                .with_context(|| format!("Failed to load configuration {}", config.display()))?;
            let pipeline = Pipeline::new(config)?;
            let summary = pipeline.run().context("Pipeline failed")?;

            println!("Boundary: {:?}", summary.boundary_origin);
            println!("Grid: {} x {}", summary.grid.shape.1, summary.grid.shape.0);
            println!("Features: {}", summary.feature_names.join(", "));
            println!("Training samples: {}", summary.training.n_training);
            println!("RMSE: {:.3}", summary.training.rmse);
            if let Some(v) = summary.training.validation_rmse {
                println!("Validation RMSE: {:.3}", v);
            }
            println!(
                "Pixels: {} predicted, {} excluded",
                summary.prediction.predicted, summary.prediction.excluded
            );
            println!("Total biomass: {:.1} Mg", summary.total_biomass_mg);
            for (key, report) in &summary.retrievals {
                if !report.is_complete() {
                    println!("{}: {} tiles missing", key, report.missing());
                }
            }
            println!("Prediction: {}", summary.outputs.prediction.display());
            println!("Summary: {}", summary.outputs.summary.display());
        }

        Commands::InitConfig { output } => {
            if output.exists() {
                bail!("{} already exists", output.display());
            }
            PipelineConfig::default()
                .write(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Configuration written to {}", output.display());
        }

        Commands::Fetch {
            endpoint,
            image,
            band,
            bbox,
            scale,
            grid,
            pause_ms,
            output,
        } => {
            let bbox = BoundingBox::new(bbox[0], bbox[2], bbox[1], bbox[3]);
            if !bbox.is_valid() {
                bail!("Invalid bounding box: {:?}", bbox);
            }
            let start = Instant::now();
            let source = HttpTileSource::new(endpoint, image, band, Duration::from_secs(300))?;
            let retriever = TiledRetriever::new(grid, Duration::from_millis(pause_ms));
            let report = retriever
                .retrieve_to_file(&source, &bbox, scale, &output)
                .context("Tiled retrieval failed")?;

            println!(
                "Tiles: {} fetched, {} degraded, {} missing",
                report.fetched(),
                report.degraded(),
                report.missing()
            );
            if !report.dropped_rows.is_empty() {
                println!("Dropped tile rows: {:?}", report.dropped_rows);
            }
            println!("Written {} in {:.1}s", output.display(), start.elapsed().as_secs_f64());
        }

        Commands::Slope { input, output } => {
            let dem = read_geotiff(&input, 1).with_context(|| format!("Failed to read {}", input.display()))?;
            let slope = TerrainAnalyzer::slope_degrees(&dem)?;
            write_geotiff(&slope, &output, None)?;
            println!("Slope written to {}", output.display());
        }
    }

    Ok(())
}
