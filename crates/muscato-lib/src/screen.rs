//! Target scanner.
//!
//! Streams the target collection, maintains the rolling-hash bank across
//! each target, and reports a candidate hit for every (offset, position)
//! where all hashes land in the offset's Bloom bitset. Bloom queries have no
//! false negatives, so every true coincidence with an entropy-accepted
//! window key is reported at least once; false positives are filtered by the
//! verifier.
//!
//! Concurrency: a worker pool processes targets in parallel (rolling within
//! one target is strictly sequential). Candidate records flow through one
//! bounded channel per offset to a single writer thread per output stream.

use std::io::{BufRead, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::extsort::ExternalSorter;
use crate::io::lines::GzLineWriter;
use crate::io::open_text_reader;
use crate::pipeline::RunContext;
use crate::sketch::rolling::{HashTables, RollingHashBank};
use crate::sketch::BloomSet;

/// Bounded depth of each per-offset emit channel.
const EMIT_CHANNEL_DEPTH: usize = 4096;

/// Iterates target sequences with their serial numbers. The serial is the
/// zero-based line number, which is exactly the target id assigned at
/// preprocessing time.
struct TargetLines<R> {
    reader: R,
    buf: Vec<u8>,
    tnum: usize,
}

impl<R: BufRead> Iterator for TargetLines<R> {
    type Item = Result<(usize, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Err(e) => Some(Err(e.into())),
            Ok(0) => None,
            Ok(_) => {
                while self.buf.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
                    self.buf.pop();
                }
                // The sequence is the first tab-separated field.
                let end = self
                    .buf
                    .iter()
                    .position(|&b| b == b'\t')
                    .unwrap_or(self.buf.len());
                let tnum = self.tnum;
                self.tnum += 1;
                Some(Ok((tnum, self.buf[..end].to_vec())))
            }
        }
    }
}

/// Scan every target against the per-offset Bloom bitsets, writing one
/// candidate-hit stream per offset.
pub fn screen_targets(
    cfg: &Config,
    ctx: &RunContext,
    blooms: &[BloomSet],
    tables: &HashTables,
) -> Result<()> {
    info!("scanning targets in {}", cfg.gene_file_name.display());

    let reader = open_text_reader(&cfg.gene_file_name)?;
    let targets = TargetLines {
        reader,
        buf: Vec::with_capacity(1024 * 1024),
        tnum: 0,
    };

    std::thread::scope(|scope| -> Result<()> {
        let mut senders: Vec<SyncSender<Vec<u8>>> = Vec::with_capacity(blooms.len());
        let mut writers = Vec::with_capacity(blooms.len());
        for k in 0..blooms.len() {
            let (tx, rx) = sync_channel::<Vec<u8>>(EMIT_CHANNEL_DEPTH);
            let path = ctx.candidate_path(k, false);
            writers.push(scope.spawn(move || write_candidates(rx, &path)));
            senders.push(tx);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.scan_threads())
            .build()
            .context("failed to build scanner thread pool")?;

        let scan = pool.install(|| {
            targets.par_bridge().try_for_each_init(
                || ScanState::new(senders.clone(), tables.clone(), blooms.len()),
                |state, item| -> Result<()> {
                    let (tnum, seq) = item?;
                    ctx.check_cancelled()?;
                    scan_one_target(cfg, blooms, state, tnum, &seq)
                },
            )
        });
        drop(senders);

        let mut result = scan;
        for writer in writers {
            let joined = match writer.join() {
                Ok(r) => r,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            if result.is_ok() {
                result = joined;
            }
        }
        result
    })?;

    info!("target scan done");
    Ok(())
}

/// Per-worker scratch: hash bank, reduced bit positions, and one pending
/// output buffer per offset so a target's hits go to each writer in a single
/// bounded-channel send.
struct ScanState {
    senders: Vec<SyncSender<Vec<u8>>>,
    bank: RollingHashBank,
    positions: Vec<u64>,
    pending: Vec<Vec<u8>>,
}

impl ScanState {
    fn new(senders: Vec<SyncSender<Vec<u8>>>, tables: HashTables, nwin: usize) -> Self {
        Self {
            senders,
            bank: RollingHashBank::new(tables),
            positions: Vec::new(),
            pending: vec![Vec::new(); nwin],
        }
    }
}

fn scan_one_target(
    cfg: &Config,
    blooms: &[BloomSet],
    state: &mut ScanState,
    tnum: usize,
    seq: &[u8],
) -> Result<()> {
    let w = cfg.window_width;
    if seq.len() < w {
        // Cannot fit even one window.
        return Ok(());
    }

    state.bank.reset();
    state.bank.write(&seq[..w]);

    for j in (w - 1)..seq.len() {
        if j >= w {
            state.bank.roll(seq[j]);
        }

        // One shared hash evaluation, probed against every offset's bitset.
        blooms[0].reduce_sums(state.bank.sums(), &mut state.positions);
        for (k, bloom) in blooms.iter().enumerate() {
            if !bloom.contains_positions(&state.positions) {
                continue;
            }
            let q = cfg.windows[k];
            // The read aligns starting at jx - q; candidacy requires that to
            // be non-negative. At the very first window only offset 0 can
            // qualify.
            if j + 1 < q + w {
                continue;
            }
            let jx = j + 1 - w;
            let jz = (j + 1 + cfg.max_read_length - w - q).min(seq.len());

            let buf = &mut state.pending[k];
            buf.extend_from_slice(&seq[jx..j + 1]);
            buf.push(b'\t');
            buf.extend_from_slice(&seq[jx - q..jx]);
            buf.push(b'\t');
            buf.extend_from_slice(&seq[j + 1..jz]);
            buf.extend_from_slice(format!("\t{tnum:011}\t{jx:011}\n").as_bytes());
        }
    }

    for (k, buf) in state.pending.iter_mut().enumerate() {
        if buf.is_empty() {
            continue;
        }
        if state.senders[k].send(std::mem::take(buf)).is_err() {
            bail!("candidate writer for window {k} closed");
        }
    }
    Ok(())
}

fn write_candidates(rx: Receiver<Vec<u8>>, path: &std::path::Path) -> Result<()> {
    let mut wtr = GzLineWriter::create(path)?;
    while let Ok(buf) = rx.recv() {
        wtr.write_all(&buf)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    wtr.finish()
}

/// Sort each per-offset candidate stream by window key for the verifier's
/// streaming join.
pub fn sort_candidate_hits(cfg: &Config, ctx: &RunContext) -> Result<()> {
    (0..cfg.windows.len())
        .into_par_iter()
        .try_for_each(|k| -> Result<()> {
            ExternalSorter::new(ctx.sort_scratch())
                .memory_budget(cfg.sort_mem)
                .threads(cfg.sort_par)
                .sort_file(&ctx.candidate_path(k, false), &ctx.candidate_path(k, true))
                .with_context(|| format!("sorting candidate hits for window {k}"))?;
            std::fs::remove_file(ctx.candidate_path(k, false)).ok();
            Ok(())
        })
}
