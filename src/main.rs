use clap::Parser;
use env_logger::Env;
use focal_series::cli::Args;
use focal_series::config::PipelineConfig;
use focal_series::error::{PipelineError, Result};
use focal_series::pipeline::Plan;
use focal_series::source::{CatalogSource, MemorySource};
use log::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Focal Series Pipeline ===");

    if let Err(e) = run(&args) {
        error!("{}", e);
        return Err(e);
    }

    info!("=== Done! ===");
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    // Set thread pool size if specified
    if let Some(n_threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| PipelineError::InvalidConfig(format!("thread pool: {}", e)))?;
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    let config = PipelineConfig::load(&args.config)?;
    let plan = Plan::new(config, &args.output_dir)?;
    for line in plan.describe().lines() {
        info!("{}", line);
    }

    if args.dry_run {
        info!("Dry run: no imagery read, nothing written");
        return Ok(());
    }

    let points = plan.load_points()?;
    let outputs = match &plan.config().catalog {
        Some(path) => {
            let catalog = CatalogSource::open(path, &plan.config().crs)?;
            plan.evaluate(&catalog, &points)?
        }
        None if plan.config().series.is_empty() => plan.evaluate(&MemorySource::default(), &points)?,
        None => {
            return Err(PipelineError::InvalidConfig(
                "series need a scene catalog".to_string(),
            ))
        }
    };

    for path in outputs.tables.iter().chain(&outputs.images) {
        info!("Output: {}", path.display());
    }
    Ok(())
}
