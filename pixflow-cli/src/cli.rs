use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pixflow::PrefetchDestination;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "pixflow", author, version, about = "Fetch, cache and process images", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "PIXFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disk cache directory, overrides the configuration file
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load images through the pipeline and write the results
    Fetch {
        #[arg(required = true)]
        urls: Vec<Url>,

        /// Output directory, defaults to the configured one or the current directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Resize to WIDTHxHEIGHT, filling the target and keeping the aspect ratio
        #[arg(long, value_parser = parse_size)]
        resize: Option<(u32, u32)>,

        /// Crop the overflow when resizing
        #[arg(long, requires = "resize")]
        crop: bool,

        /// Mask to a circle
        #[arg(long, conflicts_with = "rounded")]
        circle: bool,

        /// Round the corners with this radius in pixels
        #[arg(long)]
        rounded: Option<u32>,

        /// Ignore cached data
        #[arg(long)]
        reload: bool,

        /// Emit previews of progressive JPEGs while they download
        #[arg(long)]
        progressive: bool,
    },

    /// Warm a cache without writing any output
    Prefetch {
        #[arg(required = true)]
        urls: Vec<Url>,

        #[arg(long, value_enum, default_value_t = PrefetchDestination::DiskCache)]
        destination: PrefetchDestination,

        /// Maximum number of concurrent prefetches
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
    },

    /// Inspect or maintain the disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum CacheAction {
    /// Show location, entry count and size
    Stats,
    /// Trim the cache down to its configured limits
    Sweep,
    /// Remove every entry
    Clear,
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{value}'"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid width '{width}': {e}"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid height '{height}': {e}"))?;
    if width == 0 || height == 0 {
        return Err("size must be non-zero".to_owned());
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("320x240"), Ok((320, 240)));
        assert_eq!(parse_size("64X64"), Ok((64, 64)));
        assert!(parse_size("320").is_err());
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn parses_fetch() {
        let args = Args::parse_from([
            "pixflow",
            "-v",
            "fetch",
            "https://example.com/a.jpg",
            "--resize",
            "100x50",
            "--crop",
        ]);
        assert!(args.verbose);
        match args.command {
            Commands::Fetch {
                urls, resize, crop, ..
            } => {
                assert_eq!(urls.len(), 1);
                assert_eq!(resize, Some((100, 50)));
                assert!(crop);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn prefetch_defaults_to_disk() {
        let args = Args::parse_from(["pixflow", "prefetch", "https://example.com/a.jpg"]);
        match args.command {
            Commands::Prefetch {
                destination,
                max_concurrent,
                ..
            } => {
                assert_eq!(destination, PrefetchDestination::DiskCache);
                assert_eq!(max_concurrent, 4);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
