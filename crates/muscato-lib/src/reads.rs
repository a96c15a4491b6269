//! Read corpus preparation.
//!
//! Raw sequencing reads are canonicalized (length gate, X-substitution,
//! truncation), sorted by sequence bytes, and deduplicated into one record
//! per distinct sequence carrying a multiplicity and the ";"-joined input
//! names. The resulting table feeds both window generation and the final
//! name join.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::extsort::ExternalSorter;
use crate::io::lines::{open_gz_reader, split_fields, GzLineWriter, LineReader};
use crate::io::reads::{mask_non_acgt, SeqReader};
use crate::io::open_text_reader;
use crate::pipeline::RunContext;

/// Upper bound on the stored name (and name-list) length, in bytes.
const MAX_NAME_LEN: usize = 1000;

/// Sequence counts recorded by the dedup pass; persisted to the log
/// directory and used for the sketch fill-rate diagnostic.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SeqCensus {
    pub num_total: u64,
    pub num_unique: u64,
}

/// Truncate `text` to `MAX_NAME_LEN` bytes, marking the cut with "...".
fn clip_name(mut text: Vec<u8>) -> Vec<u8> {
    if text.len() > MAX_NAME_LEN {
        text.truncate(MAX_NAME_LEN - 3);
        text.extend_from_slice(b"...");
    }
    text
}

/// Build the deduplicated, sequence-sorted read table.
pub fn prepare_read_corpus(cfg: &Config, ctx: &RunContext) -> Result<SeqCensus> {
    info!("preparing read corpus from {}", cfg.read_file_name.display());

    let unsorted = ctx.temp_path("reads_raw.txt.gz");
    let sorted = ctx.temp_path("reads_raw_sorted.txt.gz");

    // Pass 1: canonicalize into (sequence, name) lines.
    let mut reader = SeqReader::new(open_text_reader(&cfg.read_file_name)?);
    let mut wtr = GzLineWriter::create(&unsorted)?;
    let mut nskip = 0u64;
    let mut nkept = 0u64;
    let mut line = Vec::with_capacity(cfg.max_read_length + MAX_NAME_LEN + 1);
    while let Some(mut rec) = reader.next_record()? {
        ctx.check_cancelled()?;
        if rec.seq.len() < cfg.min_read_length {
            nskip += 1;
            continue;
        }
        mask_non_acgt(&mut rec.seq);
        rec.seq.truncate(cfg.max_read_length);
        let name = clip_name(rec.name);

        line.clear();
        line.extend_from_slice(&rec.seq);
        line.push(b'\t');
        line.extend_from_slice(&name);
        wtr.write_line(&line)?;
        nkept += 1;
        if nkept % 1_000_000 == 0 {
            info!("ingested {nkept} reads");
        }
    }
    wtr.finish()?;
    info!("skipped {nskip} reads shorter than {}", cfg.min_read_length);
    if nkept == 0 {
        bail!(
            "no reads from {} passed the length filter",
            cfg.read_file_name.display()
        );
    }

    ExternalSorter::new(ctx.sort_scratch())
        .memory_budget(cfg.sort_mem)
        .threads(cfg.sort_par)
        .sort_file(&unsorted, &sorted)
        .context("sorting read corpus")?;
    std::fs::remove_file(&unsorted).ok();

    // Pass 2: coalesce runs of identical sequences.
    let census = dedup_sorted_reads(&sorted, &ctx.reads_sorted_path())?;
    std::fs::remove_file(&sorted).ok();

    info!(
        "read corpus: {} total, {} unique sequences",
        census.num_total, census.num_unique
    );
    Ok(census)
}

/// Linear dedup over the sequence-sorted (sequence, name) stream.
fn dedup_sorted_reads(sorted: &std::path::Path, out_path: &std::path::Path) -> Result<SeqCensus> {
    let mut reader = LineReader::new(open_gz_reader(sorted)?);
    let mut wtr = GzLineWriter::create(out_path)?;

    let mut census = SeqCensus {
        num_total: 0,
        num_unique: 0,
    };
    let mut seq: Vec<u8> = Vec::new();
    let mut names: Vec<u8> = Vec::new();
    let mut mult = 0u64;
    let mut record = Vec::new();

    let flush = |seq: &[u8], names: Vec<u8>, mult: u64, record: &mut Vec<u8>, wtr: &mut GzLineWriter| -> Result<()> {
        record.clear();
        record.extend_from_slice(seq);
        record.extend_from_slice(format!("\t{mult}\t").as_bytes());
        record.extend_from_slice(&clip_name(names));
        wtr.write_line(record)
    };

    while reader.advance()? {
        let line = reader.line();
        let fields = split_fields(line);
        if fields.len() != 2 {
            bail!(
                "sorted read stream: expected 2 fields at line {}, found {}",
                reader.line_number(),
                fields.len()
            );
        }
        census.num_total += 1;

        if mult > 0 && fields[0] == seq.as_slice() {
            names.push(b';');
            names.extend_from_slice(fields[1]);
            mult += 1;
            continue;
        }
        if mult > 0 {
            flush(&seq, std::mem::take(&mut names), mult, &mut record, &mut wtr)?;
            census.num_unique += 1;
        }
        seq.clear();
        seq.extend_from_slice(fields[0]);
        names.clear();
        names.extend_from_slice(fields[1]);
        mult = 1;
    }
    if mult > 0 {
        flush(&seq, names, mult, &mut record, &mut wtr)?;
        census.num_unique += 1;
    }
    wtr.finish()?;
    Ok(census)
}
