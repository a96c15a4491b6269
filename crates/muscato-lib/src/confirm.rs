//! Candidate verifier.
//!
//! For one window offset, joins the sorted windowed-read stream and the
//! sorted candidate-hit stream on the window key, then checks every
//! read/candidate pair of a joined block for a gapless full-extent match.
//! Matching pairs become confirmed-match records; a per-key retention policy
//! (`first` or approximate `best`) bounds the output.
//!
//! Both inputs must be non-decreasing in the window key; a violation is
//! fatal. Block pairs are handed to a pool of `MaxConfirmProcs` workers, and
//! results funnel through one bounded channel to a single writer.

use std::cmp::Ordering;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::config::{Config, MatchMode};
use crate::error::EngineError;
use crate::io::lines::{open_gz_reader, GzLineWriter, LineReader};
use crate::pipeline::RunContext;

/// Fields in a windowed read record: key, left tail, right tail.
const READ_FIELDS: usize = 3;
/// Fields in a candidate hit: key, left pad, right pad, target id, position.
const HIT_FIELDS: usize = 5;

/// Batches contiguous records sharing the same window key.
///
/// After `next_block` returns true the block is in `recs`; a record read past
/// the block boundary is stashed and prefixes the next block. At end of
/// stream the final block stays observable for one more call.
struct BlockReader<R> {
    lines: LineReader<R>,
    stream: String,
    nfields: usize,
    recs: Vec<Vec<u8>>,
    stash: Option<Vec<u8>>,
    done: bool,
}

fn record_key(rec: &[u8]) -> &[u8] {
    let end = rec.iter().position(|&b| b == b'\t').unwrap_or(rec.len());
    &rec[..end]
}

impl<R: BufRead> BlockReader<R> {
    fn new(reader: R, stream: String, nfields: usize) -> Self {
        Self {
            lines: LineReader::new(reader),
            stream,
            nfields,
            recs: Vec::new(),
            stash: None,
            done: false,
        }
    }

    fn key(&self) -> &[u8] {
        record_key(&self.recs[0])
    }

    /// Advance to the next block. Returns false once the final block has
    /// been observed.
    fn next_block(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        self.recs.clear();
        if let Some(rec) = self.stash.take() {
            self.recs.push(rec);
        }

        while self.lines.advance()? {
            let line = self.lines.line();
            let nfields = line.iter().filter(|&&b| b == b'\t').count() + 1;
            if nfields != self.nfields {
                return Err(EngineError::MalformedRecord {
                    stream: self.stream.clone(),
                    reason: format!(
                        "expected {} fields, found {nfields} at line {}",
                        self.nfields,
                        self.lines.line_number()
                    ),
                }
                .into());
            }
            let rec = line.to_vec();
            if let Some(first) = self.recs.first() {
                match record_key(&rec).cmp(record_key(first)) {
                    Ordering::Equal => {}
                    Ordering::Greater => {
                        self.stash = Some(rec);
                        return Ok(true);
                    }
                    Ordering::Less => {
                        return Err(EngineError::SortOrderViolation {
                            stream: self.stream.clone(),
                            line: self.lines.line_number(),
                        }
                        .into());
                    }
                }
            }
            self.recs.push(rec);
        }

        self.done = true;
        Ok(true)
    }
}

/// Number of unequal positions over the common prefix of two byte slices.
fn cdiff(x: &[u8], y: &[u8]) -> usize {
    x.iter().zip(y).filter(|(a, b)| a != b).count()
}

/// Insert into a small array kept heap-ordered by mismatch count (fewest at
/// the root), then lazily truncate to `cap`. This keeps low-mismatch matches
/// with high probability but is deliberately not an exact top-K.
fn heap_insert(heap: &mut Vec<(usize, Vec<u8>)>, item: (usize, Vec<u8>), cap: usize) {
    heap.push(item);
    let mut i = heap.len() - 1;
    while i > 0 {
        let parent = (i - 1) / 2;
        if heap[parent].0 > heap[i].0 {
            heap.swap(parent, i);
            i = parent;
        } else {
            break;
        }
    }
    if heap.len() > cap {
        heap.truncate(cap);
    }
}

/// Check every read/candidate pair of one joined block and append the
/// confirmed-match records to `out`.
fn search_pairs(
    cfg: &Config,
    reads: &[Vec<u8>],
    hits: &[Vec<u8>],
    stream: &str,
    out: &mut Vec<u8>,
) -> Result<()> {
    if reads.len() * hits.len() > 100_000 {
        debug!("large block join: {} reads x {} hits", reads.len(), hits.len());
    }

    let first = cfg.match_mode == MatchMode::First;
    let mut kept: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut line = Vec::new();

    'hits: for hit in hits {
        let hf: Vec<&[u8]> = hit.split(|&b| b == b'\t').collect();
        let (key, tlft, trgt, tid, pos) = (hf[0], hf[1], hf[2], hf[3], hf[4]);
        let pos: usize = std::str::from_utf8(pos)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EngineError::MalformedRecord {
                stream: stream.to_string(),
                reason: format!("unparsable position {:?}", String::from_utf8_lossy(pos)),
            })?;

        for read in reads {
            let rf: Vec<&[u8]> = read.split(|&b| b == b'\t').collect();
            let (rlft, rrgt) = (rf[1], rf[2]);

            // Allowed mismatches over the full aligned read.
            let read_len = key.len() + rlft.len() + rrgt.len();
            let nmiss = ((1.0 - cfg.p_match) * read_len as f64) as usize;

            // Target ends before the read would end.
            if rrgt.len() > trgt.len() {
                continue;
            }
            let m = rrgt.len();
            let nx = cdiff(tlft, rlft) + cdiff(&trgt[..m], rrgt);
            if nx > nmiss {
                continue;
            }

            let toff = pos.checked_sub(tlft.len()).ok_or_else(|| {
                EngineError::MalformedRecord {
                    stream: stream.to_string(),
                    reason: format!("position {pos} smaller than left pad"),
                }
            })?;

            line.clear();
            line.extend_from_slice(rlft);
            line.extend_from_slice(key);
            line.extend_from_slice(rrgt);
            line.push(b'\t');
            line.extend_from_slice(tlft);
            line.extend_from_slice(key);
            line.extend_from_slice(&trgt[..m]);
            line.extend_from_slice(format!("\t{toff}\t{nx}\t").as_bytes());
            line.extend_from_slice(tid);

            if first {
                kept.push((nx, line.clone()));
                if kept.len() >= cfg.max_matches {
                    break 'hits;
                }
            } else {
                heap_insert(&mut kept, (nx, line.clone()), cfg.max_matches);
            }
        }
    }

    for (_, rec) in kept {
        out.extend_from_slice(&rec);
        out.push(b'\n');
    }
    Ok(())
}

fn worker_loop(
    cfg: &Config,
    stream: String,
    rx: Receiver<(Vec<Vec<u8>>, Vec<Vec<u8>>)>,
    results: SyncSender<Vec<u8>>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    while let Ok((reads, hits)) = rx.recv() {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(EngineError::Cancelled.into());
        }
        let mut out = Vec::new();
        search_pairs(cfg, &reads, &hits, &stream, &mut out)?;
        if !out.is_empty() && results.send(out).is_err() {
            bail!("confirmed-match writer closed");
        }
    }
    Ok(())
}

/// Verify all candidate hits for window `k`, writing the confirmed-match
/// stream.
pub fn verify_window(cfg: &Config, ctx: &RunContext, k: usize) -> Result<()> {
    info!("verifying candidates for window {k}");

    let stream = format!("smatch_{k}");
    let mut reads = BlockReader::new(
        open_gz_reader(&ctx.windowed_path(k, true))?,
        format!("win_{k}_sorted"),
        READ_FIELDS,
    );
    let mut hits = BlockReader::new(
        open_gz_reader(&ctx.candidate_path(k, true))?,
        stream.clone(),
        HIT_FIELDS,
    );

    let nworkers = cfg.max_confirm_procs.max(1);
    let out_path = ctx.verified_path(k);

    std::thread::scope(|scope| -> Result<()> {
        let (res_tx, res_rx) = sync_channel::<Vec<u8>>(4 * nworkers);
        let writer = scope.spawn({
            let out_path = out_path.clone();
            move || -> Result<()> {
                let mut wtr = GzLineWriter::create(&out_path)?;
                while let Ok(buf) = res_rx.recv() {
                    wtr.write_all(&buf)?;
                }
                wtr.finish()
            }
        });

        let mut work_txs: Vec<SyncSender<(Vec<Vec<u8>>, Vec<Vec<u8>>)>> = Vec::new();
        let mut workers = Vec::new();
        for _ in 0..nworkers {
            let (tx, rx) = sync_channel(2);
            let results = res_tx.clone();
            let cancel = ctx.cancel_flag();
            let stream = stream.clone();
            workers.push(scope.spawn(move || worker_loop(cfg, stream, rx, results, cancel)));
            work_txs.push(tx);
        }
        drop(res_tx);

        let join_result = (|| -> Result<()> {
            reads.next_block()?;
            hits.next_block()?;
            let mut next = 0usize;
            let mut nblocks = 0u64;
            while !reads.recs.is_empty() && !hits.recs.is_empty() {
                ctx.check_cancelled()?;
                match reads.key().cmp(hits.key()) {
                    Ordering::Equal => {
                        let pair = (reads.recs.clone(), hits.recs.clone());
                        if work_txs[next % nworkers].send(pair).is_err() {
                            bail!("verifier worker exited early");
                        }
                        next += 1;
                        nblocks += 1;
                        let more_reads = reads.next_block()?;
                        let more_hits = hits.next_block()?;
                        if !(more_reads || more_hits) {
                            break;
                        }
                    }
                    Ordering::Less => {
                        if !reads.next_block()? {
                            break;
                        }
                    }
                    Ordering::Greater => {
                        if !hits.next_block()? {
                            break;
                        }
                    }
                }
            }
            debug!("window {k}: dispatched {nblocks} joined blocks");
            Ok(())
        })();

        drop(work_txs);
        let mut worker_err = None;
        for handle in workers {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    worker_err.get_or_insert(e);
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        let writer_result = match writer.join() {
            Ok(r) => r,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        // A dispatch failure is a symptom of a worker's death; report the
        // worker's own error when there is one.
        if let Some(e) = worker_err {
            return Err(e);
        }
        join_result?;
        writer_result
    })
}
