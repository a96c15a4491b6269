//! Post-run reports: the non-match FASTQ and per-read statistics.
//!
//! Both are derived from the final results file. The non-match report
//! sketches every matched read sequence into a Bloom set and then streams
//! the deduplicated read table, emitting reads the sketch has definitely
//! never seen. A Bloom false positive can suppress a non-matched read, but
//! no matched read is ever reported as unmatched.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use rustc_hash::FxHashSet;
use tracing::info;

use crate::config::Config;
use crate::error::EngineError;
use crate::io::lines::{open_gz_reader, split_fields, LineReader};
use crate::pipeline::RunContext;
use crate::sketch::rolling::{build_hash_tables, RollingHashBank};
use crate::sketch::BloomSet;

/// Hash count for the matched-sequence sketch.
const NONMATCH_HASHES: usize = 5;

/// `results.txt` -> `results.nonmatch.txt.fastq`.
fn nonmatch_path(results: &Path) -> PathBuf {
    let stem = results
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".into());
    let name = match results.extension() {
        Some(ext) => format!("{stem}.nonmatch.{}.fastq", ext.to_string_lossy()),
        None => format!("{stem}.nonmatch.fastq"),
    };
    results.with_file_name(name)
}

/// `results.txt` -> `results_readstats.txt`.
fn readstats_path(results: &Path) -> PathBuf {
    let stem = results
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".into());
    let name = match results.extension() {
        Some(ext) => format!("{stem}_readstats.{}", ext.to_string_lossy()),
        None => format!("{stem}_readstats"),
    };
    results.with_file_name(name)
}

/// Emit a FASTQ record for every read whose sequence appears nowhere in the
/// results.
pub fn write_nonmatch(cfg: &Config, ctx: &RunContext) -> Result<()> {
    info!("writing non-match report");

    let tables = build_hash_tables(NONMATCH_HASHES);
    let mut bank = RollingHashBank::new(tables);
    let mut sketch = BloomSet::new(cfg.bloom_size);

    let results = File::open(&cfg.results_file_name).map_err(|e| {
        EngineError::io(format!("failed to open {}", cfg.results_file_name.display()), e)
    })?;
    let mut reader = LineReader::new(BufReader::new(results));
    while reader.advance()? {
        let line = reader.line();
        let seq = line.split(|&b| b == b'\t').next().unwrap_or(line);
        bank.reset();
        bank.write(seq);
        sketch.insert_sums(bank.sums());
    }

    let out_path = nonmatch_path(&cfg.results_file_name);
    let mut wtr = BufWriter::new(File::create(&out_path).map_err(|e| {
        EngineError::io(format!("failed to create {}", out_path.display()), e)
    })?);

    let mut table = LineReader::new(open_gz_reader(&ctx.reads_sorted_path())?);
    let mut nout = 0u64;
    while table.advance()? {
        let fields = split_fields(table.line());
        let (seq, mult, names) = (fields[0], fields[1], fields[2]);
        bank.reset();
        bank.write(seq);
        if sketch.contains_sums(bank.sums()) {
            continue;
        }
        wtr.write_all(b"@")?;
        wtr.write_all(names)?;
        wtr.write_all(b"#")?;
        wtr.write_all(mult)?;
        wtr.write_all(b"\n")?;
        wtr.write_all(seq)?;
        wtr.write_all(b"\n+\n")?;
        for _ in 0..seq.len() {
            wtr.write_all(b"!")?;
        }
        wtr.write_all(b"\n")?;
        nout += 1;
    }
    wtr.flush()?;
    info!("{nout} unmatched reads written to {}", out_path.display());
    Ok(())
}

/// Per-read match statistics over the results stream, which arrives grouped
/// by read identifier: every distinct target name the read matched, each
/// followed by ";". Gene names are emitted in byte order so the output is
/// deterministic.
pub fn write_read_stats(cfg: &Config) -> Result<()> {
    info!("writing per-read statistics");

    let results = File::open(&cfg.results_file_name).map_err(|e| {
        EngineError::io(format!("failed to open {}", cfg.results_file_name.display()), e)
    })?;
    let mut reader = LineReader::new(BufReader::new(results));

    let out_path = readstats_path(&cfg.results_file_name);
    let mut wtr = BufWriter::new(File::create(&out_path).map_err(|e| {
        EngineError::io(format!("failed to create {}", out_path.display()), e)
    })?);

    let mut current: Vec<u8> = Vec::new();
    let mut seen = false;
    let mut genes: FxHashSet<Vec<u8>> = FxHashSet::default();

    let flush = |name: &[u8], genes: &FxHashSet<Vec<u8>>, wtr: &mut BufWriter<File>| -> Result<()> {
        let mut distinct: Vec<&[u8]> = genes.iter().map(|g| g.as_slice()).collect();
        distinct.sort_unstable();
        wtr.write_all(name)?;
        wtr.write_all(b"\t")?;
        for gene in distinct {
            wtr.write_all(gene)?;
            wtr.write_all(b";")?;
        }
        wtr.write_all(b"\n")?;
        Ok(())
    };

    while reader.advance()? {
        let fields = split_fields(reader.line());
        if fields.len() != 8 {
            anyhow::bail!(
                "{}: expected 8 columns at line {}",
                cfg.results_file_name.display(),
                reader.line_number()
            );
        }
        let (gene, names) = (fields[4], fields[7]);
        if seen && names != current.as_slice() {
            flush(&current, &genes, &mut wtr)?;
            genes.clear();
        }
        if names != current.as_slice() {
            current.clear();
            current.extend_from_slice(names);
        }
        seen = true;
        genes.insert(gene.to_vec());
    }
    if seen {
        flush(&current, &genes, &mut wtr)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stats_for(results: &str) -> String {
        let dir = TempDir::new().unwrap();
        let results_path = dir.path().join("results.txt");
        std::fs::write(&results_path, results).unwrap();
        let cfg = Config {
            results_file_name: results_path,
            ..Config::default()
        };
        write_read_stats(&cfg).unwrap();
        std::fs::read_to_string(dir.path().join("results_readstats.txt")).unwrap()
    }

    #[test]
    fn read_stats_list_every_distinct_gene_per_read() {
        // Two reads: the first matches two targets (one of them twice), the
        // second matches a single target.
        let results = "AAAA\tAAAA\t0\t0\tgeneB\t10\t2\tr0;r1\n\
                       AAAA\tAAAT\t5\t1\tgeneA\t12\t2\tr0;r1\n\
                       AAAA\tAAAA\t9\t0\tgeneB\t10\t2\tr0;r1\n\
                       CCCC\tCCCC\t3\t0\tgeneA\t12\t1\tr2\n";
        assert_eq!(stats_for(results), "r0;r1\tgeneA;geneB;\nr2\tgeneA;\n");
    }

    #[test]
    fn read_stats_on_empty_results_are_empty() {
        assert_eq!(stats_for(""), "");
    }

    #[test]
    fn read_stats_reject_short_rows() {
        let dir = TempDir::new().unwrap();
        let results_path = dir.path().join("results.txt");
        std::fs::write(&results_path, "AAAA\tAAAA\t0\t0\tgeneB\n").unwrap();
        let cfg = Config {
            results_file_name: results_path,
            ..Config::default()
        };
        assert!(write_read_stats(&cfg).is_err());
    }

    #[test]
    fn derived_paths_insert_markers_before_the_extension() {
        assert_eq!(
            nonmatch_path(Path::new("/x/results.txt")),
            PathBuf::from("/x/results.nonmatch.txt.fastq")
        );
        assert_eq!(
            nonmatch_path(Path::new("out")),
            PathBuf::from("out.nonmatch.fastq")
        );
        assert_eq!(
            readstats_path(Path::new("/x/results.txt")),
            PathBuf::from("/x/results_readstats.txt")
        );
    }
}
