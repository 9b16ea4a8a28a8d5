use anyhow::{bail, Context, Result};
use bridge::{MatchReport, SearchEstimate};
use clap::{Parser, Subcommand};
use engine::{
    create_metafile, Config, ContentDirectoryCache, ContentIndex, JsonFileStore,
    LocalFileFinder,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};

const DEFAULT_PIECE_LENGTH: u64 = 256 * 1024;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Find the files of a torrent on disk after they were moved or renamed."
)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match a metafile against the content directories
    Find {
        metafile: PathBuf,
        #[command(flatten)]
        search: SearchArgs,
        /// Trust earlier matches instead of re-hashing fully matched pieces
        #[arg(long)]
        fast: bool,
        /// Refuse to run when a piece has more combinations than this
        #[arg(long)]
        max_combinations: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how many hash combinations a match would try
    Estimate {
        metafile: PathBuf,
        #[command(flatten)]
        search: SearchArgs,
        /// Print the estimate as JSON
        #[arg(long)]
        json: bool,
    },
    /// Maintain the content directory cache
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Write a metafile describing a file or directory
    Create {
        source: PathBuf,
        /// Output path (defaults to <name>.torrent)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
        piece_length: u64,
    },
}

#[derive(clap::Args, Debug)]
struct SearchArgs {
    /// Extra content directory to index (repeatable)
    #[arg(short, long = "dir")]
    dirs: Vec<PathBuf>,
    /// Keep the cache in memory for this run only
    #[arg(long)]
    no_cache: bool,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Index a directory
    Add { directory: PathBuf },
    /// Forget a directory and everything below it
    Remove { directory: PathBuf },
    /// List cached files of an exact size
    Query { size: u64 },
    /// List every cached file
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Find {
            metafile,
            search,
            fast,
            max_combinations,
            json,
        } => {
            let mut config = config;
            config.fast_verification |= fast;
            if max_combinations.is_some() {
                config.max_combinations = max_combinations;
            }
            let report = find(metafile, search, config).await?;
            print_report(&report, json)?;
        }
        Command::Estimate {
            metafile,
            search,
            json,
        } => {
            let cache = open_cache(&config, &search)?;
            let mut finder = LocalFileFinder::from_path(&metafile)?;
            finder.connect_candidates_from(&cache);
            print_estimate(&finder.estimate(), json)?;
        }
        Command::Cache(command) => run_cache_command(&config, command)?,
        Command::Create {
            source,
            output,
            piece_length,
        } => create(&source, output, piece_length)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match Config::default_path() {
            Some(p) => p,
            None => return Ok(Config::default()),
        },
    };
    Config::load(&path).with_context(|| format!("could not load config {}", path.display()))
}

fn open_cache(config: &Config, search: &SearchArgs) -> Result<ContentDirectoryCache> {
    let cache = match (&config.cache_path, search.no_cache) {
        (Some(path), false) => {
            ContentDirectoryCache::open(&config.content_directories, JsonFileStore::new(path))
                .with_context(|| format!("could not open cache {}", path.display()))?
        }
        _ => {
            let cache = ContentDirectoryCache::in_memory();
            for dir in &config.content_directories {
                cache
                    .add_directory(dir)
                    .with_context(|| format!("could not index {}", dir.display()))?;
            }
            cache
        }
    };

    for dir in &search.dirs {
        cache
            .add_directory(dir)
            .with_context(|| format!("could not index {}", dir.display()))?;
    }
    if cache.is_empty() {
        warn!("The content cache is empty, add a directory with --dir or `refind cache add`");
    }
    Ok(cache)
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn find(metafile: PathBuf, search: SearchArgs, config: Config) -> Result<MatchReport> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current piece");
            flag.store(true, Ordering::Relaxed);
        }
    });

    tokio::task::spawn_blocking(move || -> Result<MatchReport> {
        let cache = open_cache(&config, &search)?;
        let mut finder = LocalFileFinder::from_path(&metafile)
            .with_context(|| format!("could not read metafile {}", metafile.display()))?
            .with_config(&config)
            .with_cancel_flag(cancel);
        finder.connect_candidates_from(&cache);
        Ok(finder.run()?)
    })
    .await
    .context("matching task failed")?
}

fn run_cache_command(config: &Config, command: CacheCommand) -> Result<()> {
    let Some(path) = &config.cache_path else {
        bail!("no cache_path configured, nothing to maintain");
    };
    let cache = ContentDirectoryCache::open(&config.content_directories, JsonFileStore::new(path))
        .with_context(|| format!("could not open cache {}", path.display()))?;

    match command {
        CacheCommand::Add { directory } => {
            let count = cache.add_directory(&directory)?;
            println!("Indexed {} files under {}", count, directory.display());
        }
        CacheCommand::Remove { directory } => {
            let count = cache.remove_directory(&directory)?;
            println!("Removed {} files under {}", count, directory.display());
        }
        CacheCommand::Query { size } => {
            for path in cache.files_of_size(size) {
                println!("{}", path.display());
            }
        }
        CacheCommand::List => {
            for entry in cache.entries() {
                println!("{:>14}  {}", entry.size, entry.path().display());
            }
        }
    }
    Ok(())
}

fn create(source: &Path, output: Option<PathBuf>, piece_length: u64) -> Result<()> {
    let data = create_metafile(source, piece_length)
        .with_context(|| format!("could not create metafile for {}", source.display()))?;

    let output = match output {
        Some(path) => path,
        None => {
            let name = source
                .file_name()
                .context("source path has no file name")?
                .to_string_lossy();
            PathBuf::from(format!("{}.torrent", name))
        }
    };
    std::fs::write(&output, data)
        .with_context(|| format!("could not write {}", output.display()))?;
    info!("Wrote {}", output.display());
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

fn print_report(report: &MatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.name);
    for file in &report.files {
        match &file.matched_path {
            Some(found) => println!(
                "  #{:<4} {:<22} {} -> {}",
                file.index,
                file.status,
                file.path.display(),
                found.display()
            ),
            None => println!(
                "  #{:<4} {:<22} {} ({} candidates)",
                file.index,
                file.status,
                file.path.display(),
                file.candidates
            ),
        }
    }
    println!(
        "{:.2}% matched, {}/{} pieces verified{}",
        report.percent_matched,
        report.verified_pieces,
        report.total_pieces,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn print_estimate(estimate: &SearchEstimate, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(estimate)?);
        return Ok(());
    }

    for piece in &estimate.pieces {
        println!(
            "  piece #{:<6} {} contributors, {} combinations",
            piece.piece, piece.contributors, piece.combinations
        );
    }
    println!("Total combinations: {}", estimate.total_combinations);
    if let Some(largest) = estimate.largest() {
        println!(
            "Largest piece: #{} with {} combinations",
            largest.piece, largest.combinations
        );
    }
    let unverifiable = estimate.unverifiable().count();
    if unverifiable > 0 {
        println!("{} pieces have a file without candidates", unverifiable);
    }
    Ok(())
}
