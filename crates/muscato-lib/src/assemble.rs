//! Result assembler.
//!
//! Joins the consolidated match stream against the target id dictionary and
//! the deduplicated read table. Both joins are equi-joins on a single key,
//! realized as external sort followed by a streaming merge join: the match
//! stream is re-sorted onto the join column, the dictionary side is already
//! in key order by construction.
//!
//! Final schema, tab-delimited: read sequence, aligned target subsequence,
//! target offset, mismatch count, target name, target length, read
//! multiplicity, read identifiers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::error::EngineError;
use crate::extsort::ExternalSorter;
use crate::io::lines::{open_gz_reader, split_fields, GzLineWriter, LineReader};
use crate::pipeline::RunContext;

/// Index of the target-id column in a consolidated match record.
const TID_FIELD: usize = 4;

pub fn assemble_results(cfg: &Config, ctx: &RunContext) -> Result<()> {
    info!("assembling results");

    // Matches ordered by target id, then the dictionary join.
    let by_tid = ctx.temp_path("matches_sg.txt.gz");
    ExternalSorter::new(ctx.sort_scratch())
        .memory_budget(cfg.sort_mem)
        .threads(cfg.sort_par)
        .key_field(TID_FIELD)
        .sort_file(&ctx.matches_path(), &by_tid)
        .context("sorting matches by target id")?;

    let named = ctx.temp_path("matches_sn.txt.gz");
    join_target_names(&by_tid, &cfg.gene_id_file_name, &named)?;
    std::fs::remove_file(&by_tid).ok();

    // Back to read-sequence order, then the read-table join.
    let by_seq = ctx.temp_path("matches_sn_sorted.txt.gz");
    ExternalSorter::new(ctx.sort_scratch())
        .memory_budget(cfg.sort_mem)
        .threads(cfg.sort_par)
        .sort_file(&named, &by_seq)
        .context("sorting matches by read sequence")?;
    std::fs::remove_file(&named).ok();

    join_read_names(&by_seq, &ctx.reads_sorted_path(), &cfg.results_file_name)?;
    std::fs::remove_file(&by_seq).ok();
    Ok(())
}

/// Streaming merge join of a key-sorted left stream against an ascending
/// unique dictionary. `emit` receives the left record's fields and the
/// dictionary record's fields.
fn merge_join(
    left_path: &Path,
    left_name: &str,
    left_key: usize,
    dict_path: &Path,
    dict_name: &str,
    mut emit: impl FnMut(&[&[u8]], &[&[u8]]) -> Result<()>,
) -> Result<()> {
    let mut left = LineReader::new(open_gz_reader(left_path)?);
    let mut dict = LineReader::new(open_gz_reader(dict_path)?);

    let mut dict_rec: Option<Vec<u8>> = None;
    let mut prev_key: Vec<u8> = Vec::new();

    while left.advance()? {
        let line = left.line();
        let fields = split_fields(line);
        let key = *fields.get(left_key).ok_or_else(|| EngineError::MalformedRecord {
            stream: left_name.into(),
            reason: format!("missing join key at line {}", left.line_number()),
        })?;

        if !prev_key.is_empty() && key < prev_key.as_slice() {
            return Err(EngineError::SortOrderViolation {
                stream: left_name.into(),
                line: left.line_number(),
            }
            .into());
        }
        if prev_key.as_slice() != key {
            prev_key.clear();
            prev_key.extend_from_slice(key);
        }

        // Advance the dictionary until its key is >= the left key.
        loop {
            let dict_key = dict_rec.as_deref().map(|r| {
                let end = r.iter().position(|&b| b == b'\t').unwrap_or(r.len());
                r[..end].to_vec()
            });
            match dict_key {
                Some(k) if k.as_slice() >= key => break,
                _ => {
                    if !dict.advance()? {
                        return Err(EngineError::MalformedRecord {
                            stream: left_name.into(),
                            reason: format!(
                                "key {:?} not found in {dict_name}",
                                String::from_utf8_lossy(key)
                            ),
                        }
                        .into());
                    }
                    dict_rec = Some(dict.line().to_vec());
                }
            }
        }

        let dict_line = dict_rec.as_deref().unwrap_or_default();
        let dict_fields = split_fields(dict_line);
        if dict_fields[0] != key {
            return Err(EngineError::MalformedRecord {
                stream: left_name.into(),
                reason: format!(
                    "key {:?} not found in {dict_name}",
                    String::from_utf8_lossy(key)
                ),
            }
            .into());
        }
        emit(&fields, &dict_fields)?;
    }
    Ok(())
}

/// Replace the target id column with the target's name and length.
fn join_target_names(matches: &Path, gene_ids: &Path, output: &Path) -> Result<()> {
    let mut wtr = GzLineWriter::create(output)?;
    let mut record = Vec::new();
    merge_join(
        matches,
        "matches_sg",
        TID_FIELD,
        gene_ids,
        "gene id dictionary",
        |m, d| {
            if d.len() != 3 {
                return Err(EngineError::MalformedRecord {
                    stream: "gene id dictionary".into(),
                    reason: format!("expected 3 fields, found {}", d.len()),
                }
                .into());
            }
            record.clear();
            for f in &m[..TID_FIELD] {
                record.extend_from_slice(f);
                record.push(b'\t');
            }
            record.extend_from_slice(d[1]);
            record.push(b'\t');
            record.extend_from_slice(d[2]);
            wtr.write_line(&record)
        },
    )?;
    wtr.finish()
}

/// Append the read multiplicity and name list, producing the final plain-text
/// results file.
fn join_read_names(matches: &Path, read_table: &Path, results: &Path) -> Result<()> {
    if results.exists() {
        std::fs::remove_file(results)
            .map_err(|e| EngineError::io(format!("failed to replace {}", results.display()), e))?;
    }
    let out = File::create(results)
        .map_err(|e| EngineError::io(format!("failed to create {}", results.display()), e))?;
    let mut wtr = BufWriter::new(out);

    merge_join(matches, "matches_sn", 0, read_table, "read table", |m, d| {
        if d.len() != 3 {
            return Err(EngineError::MalformedRecord {
                stream: "read table".into(),
                reason: format!("expected 3 fields, found {}", d.len()),
            }
            .into());
        }
        for f in m {
            wtr.write_all(f)?;
            wtr.write_all(b"\t")?;
        }
        wtr.write_all(d[1])?;
        wtr.write_all(b"\t")?;
        wtr.write_all(d[2])?;
        wtr.write_all(b"\n")?;
        Ok(())
    })?;
    wtr.flush()?;
    Ok(())
}
