use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use muscato_lib::{Config, MatchMode};

#[derive(Parser)]
#[command(name = "muscato")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-genome scalable alignment tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match reads against a preprocessed target collection
    Run(RunArgs),
    /// Convert a raw target file into the processed sequence + id streams
    PrepTargets(PrepTargetsArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum CliMatchMode {
    /// Retain the first MaxMatches matches per window subsequence
    First,
    /// Retain approximately the best MaxMatches matches per window subsequence
    Best,
}

#[derive(Parser)]
struct RunArgs {
    /// JSON configuration file; command-line flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sequencing read file (FASTQ or FASTA, optionally gzipped)
    #[arg(long, value_name = "FILE")]
    reads: Option<PathBuf>,

    /// Processed target sequence file
    #[arg(long, value_name = "FILE")]
    genes: Option<PathBuf>,

    /// Processed target id file
    #[arg(long, value_name = "FILE")]
    gene_ids: Option<PathBuf>,

    /// Results file path
    #[arg(long, value_name = "FILE")]
    results: Option<PathBuf>,

    /// Starting position of each window, e.g. 0,20,40
    #[arg(long, value_delimiter = ',')]
    windows: Option<Vec<usize>>,

    /// Width of each window
    #[arg(long)]
    window_width: Option<usize>,

    /// Size of each Bloom filter, in bits
    #[arg(long)]
    bloom_size: Option<u64>,

    /// Number of hash functions
    #[arg(long)]
    num_hash: Option<usize>,

    /// Required proportion of matching positions
    #[arg(long)]
    pmatch: Option<f64>,

    /// Minimum distinct dinucleotides in a window subsequence
    #[arg(long)]
    min_dinuc: Option<usize>,

    /// Skip reads shorter than this length
    #[arg(long)]
    min_read_length: Option<usize>,

    /// Truncate reads at this length
    #[arg(long)]
    max_read_length: Option<usize>,

    /// Return no more than this many matches per window subsequence
    #[arg(long)]
    max_matches: Option<usize>,

    /// Number of concurrent match confirmation workers
    #[arg(long)]
    max_confirm_procs: Option<usize>,

    /// Mismatches allowed above each read's best fit
    #[arg(long)]
    mmtol: Option<usize>,

    /// Match retention policy
    #[arg(long, value_enum)]
    match_mode: Option<CliMatchMode>,

    /// Workspace for temporary files
    #[arg(long, value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Directory for log artifacts
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Do not delete temporary files on success
    #[arg(long)]
    no_clean_temp: bool,

    /// External-sort memory budget in megabytes
    #[arg(long)]
    sort_mem: Option<usize>,

    /// Threads for sorting in-memory runs (0 = auto)
    #[arg(long)]
    sort_par: Option<usize>,

    /// Target-scanner worker threads (0 = auto)
    #[arg(long)]
    scan_concurrency: Option<usize>,
}

#[derive(Parser)]
struct PrepTargetsArgs {
    /// Raw target file (FASTA or name<TAB>sequence text, optionally gzipped)
    input: PathBuf,

    /// Output path for the processed sequence stream
    #[arg(long, value_name = "FILE")]
    seq_out: PathBuf,

    /// Output path for the target id dictionary
    #[arg(long, value_name = "FILE")]
    id_out: PathBuf,

    /// Also emit the reverse complement of every target
    #[arg(long)]
    rev: bool,
}

impl RunArgs {
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.reads {
            cfg.read_file_name = v;
        }
        if let Some(v) = self.genes {
            cfg.gene_file_name = v;
        }
        if let Some(v) = self.gene_ids {
            cfg.gene_id_file_name = v;
        }
        if let Some(v) = self.results {
            cfg.results_file_name = v;
        }
        if let Some(v) = self.windows {
            cfg.windows = v;
        }
        if let Some(v) = self.window_width {
            cfg.window_width = v;
        }
        if let Some(v) = self.bloom_size {
            cfg.bloom_size = v;
        }
        if let Some(v) = self.num_hash {
            cfg.num_hash = v;
        }
        if let Some(v) = self.pmatch {
            cfg.p_match = v;
        }
        if let Some(v) = self.min_dinuc {
            cfg.min_dinuc = v;
        }
        if let Some(v) = self.min_read_length {
            cfg.min_read_length = v;
        }
        if let Some(v) = self.max_read_length {
            cfg.max_read_length = v;
        }
        if let Some(v) = self.max_matches {
            cfg.max_matches = v;
        }
        if let Some(v) = self.max_confirm_procs {
            cfg.max_confirm_procs = v;
        }
        if let Some(v) = self.mmtol {
            cfg.mm_tol = v;
        }
        if let Some(v) = self.match_mode {
            cfg.match_mode = match v {
                CliMatchMode::First => MatchMode::First,
                CliMatchMode::Best => MatchMode::Best,
            };
        }
        if let Some(v) = self.temp_dir {
            cfg.temp_dir = v;
        }
        if let Some(v) = self.log_dir {
            cfg.log_dir = v;
        }
        if self.no_clean_temp {
            cfg.no_clean_temp = true;
        }
        if let Some(v) = self.sort_mem {
            cfg.sort_mem = v * 1024 * 1024;
        }
        if let Some(v) = self.sort_par {
            cfg.sort_par = v;
        }
        if let Some(v) = self.scan_concurrency {
            cfg.scan_concurrency = v;
        }

        cfg.resolve()?;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let cfg = args.into_config()?;
            muscato_lib::run(&cfg)?;
            info!("all done");
        }
        Commands::PrepTargets(args) => {
            let n = muscato_lib::targets::prepare_targets(
                &args.input,
                &args.seq_out,
                &args.id_out,
                args.rev,
            )?;
            info!("processed {n} targets");
        }
    }
    Ok(())
}
