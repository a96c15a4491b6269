//! Cross-window consolidator.
//!
//! Confirmed-match streams from every offset are concatenated through one
//! unique external sort, which both imposes the read-sequence grouping the
//! filter needs and deduplicates matches discovered through more than one
//! window. Within each read's group, only matches within `MMTol` of the
//! read's best mismatch count survive.

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::error::EngineError;
use crate::extsort::ExternalSorter;
use crate::io::lines::{open_gz_reader, GzLineWriter, LineReader};
use crate::pipeline::RunContext;

/// Index of the mismatch-count column in a confirmed-match record.
const NX_FIELD: usize = 3;

pub fn combine_windows(cfg: &Config, ctx: &RunContext) -> Result<()> {
    info!("consolidating matches across {} windows", cfg.windows.len());

    let inputs: Vec<std::path::PathBuf> =
        (0..cfg.windows.len()).map(|k| ctx.verified_path(k)).collect();
    let sorted = ctx.temp_path("matches_uniq.txt.gz");

    ExternalSorter::new(ctx.sort_scratch())
        .memory_budget(cfg.sort_mem)
        .threads(cfg.sort_par)
        .unique()
        .sort_files(&inputs, &sorted)
        .context("consolidating verified matches")?;

    filter_best(&sorted, &ctx.matches_path(), cfg.mm_tol)?;
    std::fs::remove_file(&sorted).ok();
    Ok(())
}

/// Stream the uniq-sorted matches grouped by read sequence (the leading
/// field), keeping records with at most `mm_tol` mismatches above the
/// group's minimum.
fn filter_best(input: &std::path::Path, output: &std::path::Path, mm_tol: usize) -> Result<()> {
    let mut reader = LineReader::new(open_gz_reader(input)?);
    let mut wtr = GzLineWriter::create(output)?;

    let mut block: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut current: Vec<u8> = Vec::new();

    let flush = |block: &mut Vec<(usize, Vec<u8>)>, wtr: &mut GzLineWriter| -> Result<()> {
        let Some(best) = block.iter().map(|(nx, _)| *nx).min() else {
            return Ok(());
        };
        for (nx, line) in block.drain(..) {
            if nx <= best + mm_tol {
                wtr.write_line(&line)?;
            }
        }
        Ok(())
    };

    while reader.advance()? {
        let line = reader.line();
        let mut fields = line.split(|&b| b == b'\t');
        let seq = fields.next().unwrap_or_default();
        let nx_bytes = fields.nth(NX_FIELD - 1).ok_or_else(|| {
            EngineError::MalformedRecord {
                stream: "matches".into(),
                reason: format!("missing mismatch field at line {}", reader.line_number()),
            }
        })?;
        let nx: usize = std::str::from_utf8(nx_bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EngineError::MalformedRecord {
                stream: "matches".into(),
                reason: format!(
                    "unparsable mismatch count at line {}",
                    reader.line_number()
                ),
            })?;

        if !current.is_empty() && seq != current.as_slice() {
            flush(&mut block, &mut wtr)?;
        }
        if current.as_slice() != seq {
            current.clear();
            current.extend_from_slice(seq);
        }
        block.push((nx, line.to_vec()));
    }
    flush(&mut block, &mut wtr)?;
    wtr.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lines::split_fields;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_gz(path: &Path, rows: &[&str]) {
        let mut w = GzLineWriter::create(path).unwrap();
        for row in rows {
            w.write_line(row.as_bytes()).unwrap();
        }
        w.finish().unwrap();
    }

    fn read_gz(path: &Path) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rdr = LineReader::new(open_gz_reader(path).unwrap());
        while rdr.advance().unwrap() {
            out.push(rdr.line().to_vec());
        }
        out
    }

    #[test]
    fn keeps_only_matches_near_the_read_minimum() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let output = dir.path().join("out.gz");
        write_gz(
            &input,
            &[
                "AAAA\tAAAA\t0\t0\t00000000000",
                "AAAA\tAATA\t5\t2\t00000000001",
                "CCCC\tCCCG\t1\t1\t00000000002",
            ],
        );

        filter_best(&input, &output, 1).unwrap();
        let rows = read_gz(&output);
        assert_eq!(rows.len(), 2);
        assert!(split_fields(&rows[0])[0] == b"AAAA" && split_fields(&rows[0])[3] == b"0");
        assert!(split_fields(&rows[1])[0] == b"CCCC");

        // With a wider tolerance both AAAA records survive.
        filter_best(&input, &output, 2).unwrap();
        assert_eq!(read_gz(&output).len(), 3);
    }

    #[test]
    fn filter_is_idempotent() {
        // P6: running the consolidation filter on its own output changes
        // nothing.
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let once = dir.path().join("once.gz");
        let twice = dir.path().join("twice.gz");
        write_gz(
            &input,
            &[
                "AAAA\tAAAA\t0\t1\t00000000000",
                "AAAA\tAATA\t5\t3\t00000000001",
                "AAAA\tATTA\t9\t2\t00000000002",
                "GGGG\tGGGG\t2\t0\t00000000000",
            ],
        );

        filter_best(&input, &once, 1).unwrap();
        filter_best(&once, &twice, 1).unwrap();
        assert_eq!(read_gz(&once), read_gz(&twice));
    }

    #[test]
    fn empty_input_produces_empty_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let output = dir.path().join("out.gz");
        write_gz(&input, &[]);
        filter_best(&input, &output, 0).unwrap();
        assert!(read_gz(&output).is_empty());
    }
}
