use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devsync::config::{expand_tilde, DownstreamOptions};
use devsync::snapshot::{diff, walk, IgnoreMatcher};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "devsync",
    version,
    about = "Downstream file sync helper for remote development environments"
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the downstream endpoint over stdin/stdout
    Downstream {
        /// TOML file with downstream options
        #[arg(long, value_name = "FILE", env = "DEVSYNC_CONFIG")]
        config: Option<PathBuf>,

        /// Exclude pattern (gitignore syntax, repeatable)
        #[arg(long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Exit as soon as stdin is closed
        #[arg(long)]
        exit_on_close: bool,

        /// Root of the tree to watch
        path: Option<PathBuf>,
    },

    /// Walk PATH and print one JSON object per entry
    Snapshot {
        /// Exclude pattern (gitignore syntax, repeatable)
        #[arg(long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    devsync::logging::init_tracing(cli.verbose);

    match cli.command {
        Commands::Downstream {
            config,
            exclude,
            exit_on_close,
            path,
        } => run_downstream(config, exclude, exit_on_close, path).await,
        Commands::Snapshot { exclude, path } => print_snapshot(exclude, path),
    }
}

async fn run_downstream(
    config: Option<PathBuf>,
    exclude: Vec<String>,
    exit_on_close: bool,
    path: Option<PathBuf>,
) -> Result<()> {
    let mut options = match config {
        Some(file) => DownstreamOptions::load(&file)
            .with_context(|| format!("Failed to load config {}", file.display()))?,
        None => DownstreamOptions::default(),
    };

    // CLI flags win over the file
    if let Some(path) = path {
        options.remote_path = path;
    }
    options.exclude_paths.extend(exclude);
    options.exit_on_close |= exit_on_close;

    let options = options.validate().context("Invalid downstream options")?;
    info!("Serving {}", options.remote_path.display());

    devsync::run_downstream(tokio::io::stdin(), tokio::io::stdout(), options)
        .await
        .context("Downstream server failed")?;
    Ok(())
}

fn print_snapshot(exclude: Vec<String>, path: PathBuf) -> Result<()> {
    let matcher = IgnoreMatcher::compile(&exclude).context("Invalid exclude pattern")?;
    let root = expand_tilde(&path);

    let (snapshot, stats) = walk(&root, matcher.as_ref(), &CancellationToken::new())
        .with_context(|| format!("Failed to walk {}", root.display()))?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    // Against an empty baseline every entry is an upsert
    for change in diff(&root, None, &snapshot) {
        serde_json::to_writer(&mut out, &change)?;
        writeln!(out)?;
    }
    out.flush()?;

    info!(
        "{} files, {} dirs, {} skipped",
        stats.files, stats.dirs, stats.skipped
    );
    Ok(())
}
