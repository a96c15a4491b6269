//! Run configuration.
//!
//! A single immutable `Config` value is passed by reference to every stage;
//! there is no module-level mutable state. The configuration can be loaded
//! from a JSON file (field names match the historical PascalCase surface) and
//! the resolved value is persisted into the log directory before the first
//! stage runs, so a failed run can be reproduced from its logs.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Per-windowKey retention policy inside the verifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Keep the first `MaxMatches` confirmed matches in encounter order.
    First,
    /// Keep approximately the `MaxMatches` matches with the fewest mismatches.
    #[default]
    Best,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    /// Sequencing reads (FASTQ or FASTA, optionally gzipped).
    pub read_file_name: PathBuf,
    /// Target sequence stream (processed form, one sequence per line).
    pub gene_file_name: PathBuf,
    /// Target id dictionary (processed form, `TID \t NAME \t LEN`).
    pub gene_id_file_name: PathBuf,
    /// Final results path.
    pub results_file_name: PathBuf,

    /// Left end point of each window within a read.
    pub windows: Vec<usize>,
    /// Width of each window.
    pub window_width: usize,
    /// Size of each Bloom filter, in bits.
    pub bloom_size: u64,
    /// Number of hash functions in the Bloom filters.
    pub num_hash: usize,
    /// Required proportion of matching positions over the aligned read.
    pub p_match: f64,
    /// A window subsequence must contain at least this many distinct
    /// dinucleotides to be used as an anchor.
    pub min_dinuc: usize,

    /// Reads shorter than this are skipped.
    pub min_read_length: usize,
    /// Reads longer than this are truncated.
    pub max_read_length: usize,

    /// Per-window cap on confirmed matches for one window subsequence.
    pub max_matches: usize,
    /// Verifier worker parallelism.
    pub max_confirm_procs: usize,
    /// Extra mismatches above the per-read minimum retained in final output.
    #[serde(rename = "MMTol")]
    pub mm_tol: usize,
    /// `first` or `best`.
    pub match_mode: MatchMode,

    /// Base directory for the run-scoped temporary directory.
    pub temp_dir: PathBuf,
    /// Base directory for log artifacts.
    pub log_dir: PathBuf,
    /// Keep the run temporary directory after a successful run.
    pub no_clean_temp: bool,

    /// External-sort in-memory run budget, in bytes.
    pub sort_mem: usize,
    /// Threads used for sorting in-memory runs (0 = all available).
    pub sort_par: usize,
    /// Target-scanner worker threads (0 = all available).
    pub scan_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_file_name: PathBuf::new(),
            gene_file_name: PathBuf::new(),
            gene_id_file_name: PathBuf::new(),
            results_file_name: PathBuf::new(),
            windows: Vec::new(),
            window_width: 0,
            bloom_size: 0,
            num_hash: 0,
            p_match: 0.0,
            min_dinuc: 0,
            min_read_length: 0,
            max_read_length: 0,
            max_matches: 0,
            max_confirm_procs: 0,
            mm_tol: 0,
            match_mode: MatchMode::Best,
            temp_dir: PathBuf::new(),
            log_dir: PathBuf::new(),
            no_clean_temp: false,
            sort_mem: 0,
            sort_par: 0,
            scan_concurrency: 0,
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let fid = File::open(path)
            .map_err(|e| EngineError::io(format!("failed to open config file {}", path.display()), e))?;
        let config: Config = serde_json::from_reader(BufReader::new(fid))
            .map_err(|e| EngineError::ConfigError(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Persist the resolved configuration as JSON.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let fid = File::create(path)
            .map_err(|e| EngineError::io(format!("failed to create {}", path.display()), e))?;
        serde_json::to_writer_pretty(BufWriter::new(fid), self)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Validate required parameters and fill in defaults.
    pub fn resolve(&mut self) -> Result<(), EngineError> {
        if self.read_file_name.as_os_str().is_empty() {
            return Err(EngineError::ConfigError("ReadFileName not provided".into()));
        }
        if self.gene_file_name.as_os_str().is_empty() {
            return Err(EngineError::ConfigError("GeneFileName not provided".into()));
        }
        if self.gene_id_file_name.as_os_str().is_empty() {
            return Err(EngineError::ConfigError("GeneIdFileName not provided".into()));
        }
        if self.windows.is_empty() {
            return Err(EngineError::ConfigError("Windows not provided".into()));
        }
        if self.window_width == 0 {
            return Err(EngineError::ConfigError("WindowWidth not provided".into()));
        }
        if self.max_read_length == 0 {
            return Err(EngineError::ConfigError("MaxReadLength not provided".into()));
        }
        if !(0.0..=1.0).contains(&self.p_match) {
            return Err(EngineError::ConfigError(format!(
                "PMatch must lie in [0, 1], got {}",
                self.p_match
            )));
        }
        for &q in &self.windows {
            if q + self.window_width > self.max_read_length {
                return Err(EngineError::ConfigError(format!(
                    "window at offset {q} extends past MaxReadLength {}",
                    self.max_read_length
                )));
            }
        }

        if self.results_file_name.as_os_str().is_empty() {
            tracing::warn!("ResultsFileName not provided, defaulting to results.txt");
            self.results_file_name = PathBuf::from("results.txt");
        }
        if self.bloom_size == 0 {
            tracing::warn!("BloomSize not provided, defaulting to 4 billion bits");
            self.bloom_size = 4_000_000_000;
        }
        if self.num_hash == 0 {
            tracing::warn!("NumHash not provided, defaulting to 20");
            self.num_hash = 20;
        }
        if self.p_match == 0.0 {
            tracing::warn!("PMatch not provided, defaulting to 1.0");
            self.p_match = 1.0;
        }
        if self.max_matches == 0 {
            tracing::warn!("MaxMatches not provided, defaulting to 1 million");
            self.max_matches = 1_000_000;
        }
        if self.max_confirm_procs == 0 {
            self.max_confirm_procs = 3;
        }
        if self.temp_dir.as_os_str().is_empty() {
            self.temp_dir = PathBuf::from("muscato_tmp");
        }
        if self.log_dir.as_os_str().is_empty() {
            self.log_dir = PathBuf::from("muscato_logs");
        }
        if self.sort_mem == 0 {
            self.sort_mem = 256 * 1024 * 1024;
        }
        Ok(())
    }

    /// Worker-thread count for the target scanner.
    pub fn scan_threads(&self) -> usize {
        if self.scan_concurrency > 0 {
            self.scan_concurrency
        } else {
            available_threads()
        }
    }
}

pub fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            read_file_name: PathBuf::from("reads.fastq"),
            gene_file_name: PathBuf::from("genes.txt.gz"),
            gene_id_file_name: PathBuf::from("gene_ids.txt.gz"),
            windows: vec![0, 20],
            window_width: 15,
            max_read_length: 100,
            ..Config::default()
        }
    }

    #[test]
    fn resolve_fills_defaults() {
        let mut cfg = minimal();
        cfg.resolve().unwrap();
        assert_eq!(cfg.bloom_size, 4_000_000_000);
        assert_eq!(cfg.num_hash, 20);
        assert_eq!(cfg.p_match, 1.0);
        assert_eq!(cfg.max_matches, 1_000_000);
        assert_eq!(cfg.match_mode, MatchMode::Best);
        assert_eq!(cfg.results_file_name, PathBuf::from("results.txt"));
    }

    #[test]
    fn resolve_rejects_missing_windows() {
        let mut cfg = minimal();
        cfg.windows.clear();
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn resolve_rejects_window_past_read_end() {
        let mut cfg = minimal();
        cfg.windows = vec![95];
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn json_roundtrip_uses_pascal_case() {
        let mut cfg = minimal();
        cfg.resolve().unwrap();
        let text = serde_json::to_string(&cfg).unwrap();
        assert!(text.contains("\"ReadFileName\""));
        assert!(text.contains("\"MMTol\""));
        assert!(text.contains("\"MatchMode\":\"best\""));
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.windows, cfg.windows);
        assert_eq!(back.bloom_size, cfg.bloom_size);
    }
}
