use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "focal-series")]
#[command(about = "Periodic raster composites, focal statistics and point sample tables")]
#[command(version)]
pub struct Args {
    /// Pipeline configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Directory receiving tables and images
    #[arg(short, long, value_name = "DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Print the plan without reading any imagery
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from(["focal-series", "--config", "p.json", "-t", "4", "--dry-run"]);
        assert_eq!(args.config, PathBuf::from("p.json"));
        assert_eq!(args.output_dir, PathBuf::from("output"));
        assert_eq!(args.threads, Some(4));
        assert!(args.dry_run);
        assert!(!args.verbose);
    }
}
