//! Window index builder.
//!
//! For every configured offset, one pass over the deduplicated read table
//! extracts the window subsequence of each long-enough read, gates it on
//! entropy, inserts it into the offset's Bloom bitset, and emits the
//! windowed record (key, left tail, right tail) into the offset's stream.
//! Offsets are independent, so they build in parallel; each bitset has a
//! single writer here and is immutable afterwards.

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::entropy::{count_dinucs, DINUC_CELLS};
use crate::error::EngineError;
use crate::extsort::ExternalSorter;
use crate::io::lines::{open_gz_reader, GzLineWriter, LineReader};
use crate::pipeline::RunContext;
use crate::sketch::rolling::{HashTables, RollingHashBank};
use crate::sketch::BloomSet;

/// Build the per-offset Bloom bitsets and sorted windowed read streams.
/// Returns the bitsets in window order.
pub fn build_window_indexes(
    cfg: &Config,
    ctx: &RunContext,
    tables: &HashTables,
) -> Result<Vec<BloomSet>> {
    info!("building window indexes for {} offsets", cfg.windows.len());

    (0..cfg.windows.len())
        .into_par_iter()
        .map(|k| build_one_window(cfg, ctx, tables, k))
        .collect()
}

fn build_one_window(
    cfg: &Config,
    ctx: &RunContext,
    tables: &HashTables,
    k: usize,
) -> Result<BloomSet> {
    let q = cfg.windows[k];
    let w = cfg.window_width;

    let mut reader = LineReader::new(open_gz_reader(&ctx.reads_sorted_path())?);
    let unsorted = ctx.windowed_path(k, false);
    let mut wtr = GzLineWriter::create(&unsorted)?;

    let mut bloom = BloomSet::new(cfg.bloom_size);
    let mut bank = RollingHashBank::new(tables.clone());
    let mut scratch = [0u32; DINUC_CELLS];
    let mut record = Vec::with_capacity(cfg.max_read_length + 2);

    let mut nread = 0u64;
    let mut ngated = 0u64;
    while reader.advance()? {
        ctx.check_cancelled()?;
        let line = reader.line();
        let seq = line.split(|&b| b == b'\t').next().unwrap_or(line);
        if seq.len() < q + w {
            continue;
        }
        nread += 1;

        let key = &seq[q..q + w];
        if count_dinucs(key, &mut scratch) < cfg.min_dinuc {
            ngated += 1;
            continue;
        }

        record.clear();
        record.extend_from_slice(key);
        record.push(b'\t');
        record.extend_from_slice(&seq[..q]);
        record.push(b'\t');
        record.extend_from_slice(&seq[q + w..]);
        wtr.write_line(&record)?;

        bank.reset();
        bank.write(key);
        bloom.insert_sums(bank.sums());
    }
    wtr.finish()?;

    info!("window {k} (offset {q}): {nread} valid reads, {ngated} gated on entropy");
    if nread == 0 {
        return Err(EngineError::EmptyWindow { window: k, offset: q }.into());
    }

    ExternalSorter::new(ctx.sort_scratch())
        .memory_budget(cfg.sort_mem)
        .threads(cfg.sort_par)
        .sort_file(&unsorted, &ctx.windowed_path(k, true))
        .with_context(|| format!("sorting windowed reads for window {k}"))?;
    std::fs::remove_file(&unsorted).ok();

    Ok(bloom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lines::split_fields;
    use crate::sketch::rolling::build_hash_tables;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, table: &[&str], windows: Vec<usize>, min_dinuc: usize) -> (Config, RunContext) {
        let mut cfg = Config {
            read_file_name: PathBuf::from("unused"),
            gene_file_name: PathBuf::from("unused"),
            gene_id_file_name: PathBuf::from("unused"),
            windows,
            window_width: 4,
            bloom_size: 4096,
            num_hash: 2,
            min_dinuc,
            max_read_length: 50,
            temp_dir: dir.path().join("tmp"),
            log_dir: dir.path().join("logs"),
            ..Config::default()
        };
        cfg.resolve().unwrap();
        let ctx = RunContext::create(&cfg).unwrap();

        let mut wtr = GzLineWriter::create(&ctx.reads_sorted_path()).unwrap();
        for row in table {
            wtr.write_line(row.as_bytes()).unwrap();
        }
        wtr.finish().unwrap();
        (cfg, ctx)
    }

    fn read_windowed(ctx: &RunContext, k: usize) -> Vec<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut rdr = LineReader::new(open_gz_reader(&ctx.windowed_path(k, true)).unwrap());
        while rdr.advance().unwrap() {
            out.push(
                split_fields(rdr.line())
                    .into_iter()
                    .map(|f| f.to_vec())
                    .collect(),
            );
        }
        out
    }

    #[test]
    fn windowed_records_carry_key_and_tails() {
        let dir = TempDir::new().unwrap();
        let (cfg, ctx) = setup(&dir, &["ACGTACGTAC\t1\tr0"], vec![0, 2], 0);
        let tables = build_hash_tables(cfg.num_hash);

        let blooms = build_window_indexes(&cfg, &ctx, &tables).unwrap();
        assert_eq!(blooms.len(), 2);

        let w0 = read_windowed(&ctx, 0);
        assert_eq!(w0, vec![vec![b"ACGT".to_vec(), b"".to_vec(), b"ACGTAC".to_vec()]]);

        let w1 = read_windowed(&ctx, 1);
        assert_eq!(w1, vec![vec![b"GTAC".to_vec(), b"AC".to_vec(), b"GTAC".to_vec()]]);

        // The windowed key is findable in the offset's Bloom set.
        let mut bank = RollingHashBank::new(tables.clone());
        bank.write(b"ACGT");
        assert!(blooms[0].contains_sums(bank.sums()));
        bank.reset();
        bank.write(b"GTAC");
        assert!(blooms[1].contains_sums(bank.sums()));
    }

    #[test]
    fn entropy_gate_skips_low_complexity_keys() {
        let dir = TempDir::new().unwrap();
        let (cfg, ctx) = setup(&dir, &["AAAAAAAAAA\t1\tr0", "ACGTACGTAC\t1\tr1"], vec![0], 2);
        let tables = build_hash_tables(cfg.num_hash);

        let blooms = build_window_indexes(&cfg, &ctx, &tables).unwrap();
        let w0 = read_windowed(&ctx, 0);
        assert_eq!(w0.len(), 1);
        assert_eq!(w0[0][0], b"ACGT");

        let mut bank = RollingHashBank::new(tables);
        bank.write(b"AAAA");
        assert!(!blooms[0].contains_sums(bank.sums()));
    }

    #[test]
    fn offset_with_no_long_enough_reads_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (cfg, ctx) = setup(&dir, &["ACGTAC\t1\tr0"], vec![0, 20], 0);
        let tables = build_hash_tables(cfg.num_hash);

        let err = build_window_indexes(&cfg, &ctx, &tables).unwrap_err();
        let engine = err.downcast_ref::<EngineError>();
        assert!(matches!(engine, Some(EngineError::EmptyWindow { window: 1, .. })));
    }
}
