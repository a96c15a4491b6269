//! Pipeline driver.
//!
//! Owns no algorithmic decisions: sequences the stages in dependency order,
//! names the intermediate artifacts inside a run-scoped temporary directory,
//! persists the resolved configuration for restart/debug, and propagates the
//! first fatal error. Intermediate artifacts are removed after a successful
//! run unless `NoCleanTemp` is set; on failure they are kept for inspection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{error, info};

use crate::config::Config;
use crate::error::EngineError;
use crate::sketch::rolling::build_hash_tables;
use crate::{assemble, combine, confirm, reads, report, screen, windows};

/// Run-scoped paths plus the shared cancellation flag.
pub struct RunContext {
    run_id: String,
    temp_dir: Option<TempDir>,
    temp_root: PathBuf,
    log_dir: PathBuf,
    sort_scratch: PathBuf,
    cancel: Arc<AtomicBool>,
    no_clean_temp: bool,
}

impl RunContext {
    /// Create unique temp and log directories beneath the configured bases.
    pub fn create(cfg: &Config) -> Result<Self> {
        std::fs::create_dir_all(&cfg.temp_dir)
            .map_err(|e| EngineError::io(format!("failed to create {}", cfg.temp_dir.display()), e))?;
        let temp_dir = tempfile::Builder::new()
            .prefix("run_")
            .tempdir_in(&cfg.temp_dir)
            .map_err(|e| {
                EngineError::io(
                    format!("failed to create run dir in {}", cfg.temp_dir.display()),
                    e,
                )
            })?;
        let temp_root = temp_dir.path().to_path_buf();

        let run_id = temp_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());

        let log_dir = cfg.log_dir.join(&run_id);
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| EngineError::io(format!("failed to create {}", log_dir.display()), e))?;

        let sort_scratch = temp_root.join("sort");
        std::fs::create_dir_all(&sort_scratch)
            .map_err(|e| EngineError::io(format!("failed to create {}", sort_scratch.display()), e))?;

        Ok(Self {
            run_id,
            temp_dir: Some(temp_dir),
            temp_root,
            log_dir,
            sort_scratch,
            cancel: Arc::new(AtomicBool::new(false)),
            no_clean_temp: cfg.no_clean_temp,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.temp_root.join(name)
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(name)
    }

    pub fn sort_scratch(&self) -> &Path {
        &self.sort_scratch
    }

    /// Deduplicated, sequence-sorted read table.
    pub fn reads_sorted_path(&self) -> PathBuf {
        self.temp_path("reads_sorted.txt.gz")
    }

    /// Windowed read stream for window `k` (sorted variant after the
    /// per-offset external sort).
    pub fn windowed_path(&self, k: usize, sorted: bool) -> PathBuf {
        if sorted {
            self.temp_path(&format!("win_{k}_sorted.txt.gz"))
        } else {
            self.temp_path(&format!("win_{k}.txt.gz"))
        }
    }

    /// Candidate-hit stream for window `k` from the target scan (sorted
    /// variant after the external sort).
    pub fn candidate_path(&self, k: usize, sorted: bool) -> PathBuf {
        if sorted {
            self.temp_path(&format!("smatch_{k}.txt.gz"))
        } else {
            self.temp_path(&format!("bmatch_{k}.txt.gz"))
        }
    }

    /// Verified per-offset match stream for window `k`.
    pub fn verified_path(&self, k: usize) -> PathBuf {
        self.temp_path(&format!("rmatch_{k}.txt.gz"))
    }

    /// Consolidated cross-window match stream.
    pub fn matches_path(&self) -> PathBuf {
        self.temp_path("matches.txt.gz")
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Signal cooperative cancellation to every running worker.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn finish(mut self, success: bool) {
        let keep = self.no_clean_temp || !success;
        if let Some(temp) = self.temp_dir.take() {
            if keep {
                let path = temp.keep();
                info!("keeping temporary files in {}", path.display());
            } else {
                info!("removing temporary files from {}", path_display(&self.temp_root));
                drop(temp);
            }
        }
    }
}

fn path_display(p: &Path) -> String {
    p.display().to_string()
}

/// Run the full matching pipeline. The configuration must already be
/// resolved (`Config::resolve`).
pub fn run(cfg: &Config) -> Result<()> {
    let ctx = RunContext::create(cfg)?;
    info!("run id {}", ctx.run_id());
    info!("temporary files in {}", ctx.temp_path("").display());
    info!("log files in {}", ctx.log_path("").display());

    let result = run_stages(cfg, &ctx);
    if let Err(ref e) = result {
        error!("run failed: {e:#}");
        ctx.cancel();
    }
    let success = result.is_ok();
    ctx.finish(success);
    result
}

fn run_stages(cfg: &Config, ctx: &RunContext) -> Result<()> {
    cfg.save_json(&ctx.log_path("config.json"))?;

    let census = reads::prepare_read_corpus(cfg, ctx)?;
    serde_json::to_writer_pretty(
        std::fs::File::create(ctx.log_path("seqinfo.json"))?,
        &census,
    )
    .context("writing sequence census")?;

    // Fill rate of the w-mer set inclusion function: how much of the k-mer
    // space the unique reads could occupy.
    let kmer_space = 4f64.powi(cfg.window_width as i32);
    info!(
        "k-mer sketch fill rate: {:.5}",
        census.num_unique as f64 / kmer_space
    );

    let tables = build_hash_tables(cfg.num_hash);

    let blooms = windows::build_window_indexes(cfg, ctx, &tables)?;
    for (k, bloom) in blooms.iter().enumerate() {
        info!(
            "window {k}: Bloom fill rate {:.3}",
            bloom.estimate_fill(1000)
        );
    }

    screen::screen_targets(cfg, ctx, &blooms, &tables)?;
    drop(blooms);
    screen::sort_candidate_hits(cfg, ctx)?;

    for k in 0..cfg.windows.len() {
        confirm::verify_window(cfg, ctx, k)?;
    }

    combine::combine_windows(cfg, ctx)?;
    assemble::assemble_results(cfg, ctx)?;

    report::write_nonmatch(cfg, ctx)?;
    report::write_read_stats(cfg)?;

    info!("results written to {}", cfg.results_file_name.display());
    Ok(())
}
