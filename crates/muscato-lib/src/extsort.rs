//! External sort over gzip line streams.
//!
//! The engine's dataflow edges are sorted text streams, so sorting is treated
//! as a primitive: byte-wise comparison on a tab-delimited key column (from
//! the column start to the end of the line, full line as tie-break), bounded
//! memory via sorted runs spilled to plain temp files, and a k-way
//! `BinaryHeap` merge. Comparisons are always on raw bytes — locale-aware
//! collation must never be reintroduced here, every downstream merge join
//! depends on this order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use rayon::prelude::*;
use tempfile::NamedTempFile;

use crate::error::EngineError;
use crate::io::lines::{open_gz_reader, GzLineWriter, LineReader};

const DEFAULT_MEM_BUDGET: usize = 256 * 1024 * 1024;

/// Per-line bookkeeping overhead charged against the memory budget.
const LINE_OVERHEAD: usize = 32;

pub struct ExternalSorter {
    scratch_dir: PathBuf,
    key_field: usize,
    unique: bool,
    mem_budget: usize,
    threads: usize,
}

impl ExternalSorter {
    pub fn new(scratch_dir: &Path) -> Self {
        Self {
            scratch_dir: scratch_dir.to_path_buf(),
            key_field: 0,
            unique: false,
            mem_budget: DEFAULT_MEM_BUDGET,
            threads: 0,
        }
    }

    /// Sort on the key starting at tab-delimited field `idx` (0-based),
    /// running to the end of the line.
    pub fn key_field(mut self, idx: usize) -> Self {
        self.key_field = idx;
        self
    }

    /// Drop lines that are byte-identical to the previously emitted line.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.mem_budget = bytes.max(64 * 1024);
        self
    }

    /// Threads for in-memory run sorting (0 = rayon's global pool).
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    /// Sort one gzip line stream into another.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<()> {
        self.sort_files(&[input.to_path_buf()], output)
    }

    /// Sort the concatenation of several gzip line streams.
    pub fn sort_files(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut runs: Vec<NamedTempFile> = Vec::new();
        let mut lines: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut pending = 0usize;

        for input in inputs {
            let mut reader = LineReader::new(open_gz_reader(input)?);
            while reader.advance()? {
                let line = reader.line();
                pending += line.len() + LINE_OVERHEAD;
                lines.push((key_start(line, self.key_field), line.to_vec()));
                if pending >= self.mem_budget {
                    runs.push(self.spill_run(&mut lines)?);
                    pending = 0;
                }
            }
        }

        let mut out = GzLineWriter::create(output)?;
        if runs.is_empty() {
            // Everything fit in memory.
            self.sort_run(&mut lines);
            let mut last: Option<Vec<u8>> = None;
            for (_, line) in lines {
                if self.unique && last.as_deref() == Some(line.as_slice()) {
                    continue;
                }
                out.write_line(&line)?;
                if self.unique {
                    last = Some(line);
                }
            }
        } else {
            if !lines.is_empty() {
                runs.push(self.spill_run(&mut lines)?);
            }
            self.merge_runs(&runs, &mut out)?;
        }
        out.finish()
    }

    fn sort_run(&self, lines: &mut [(usize, Vec<u8>)]) {
        let by_key = |a: &(usize, Vec<u8>), b: &(usize, Vec<u8>)| {
            cmp_keyed(&a.1, a.0, &b.1, b.0)
        };
        if self.threads > 0 {
            // A dedicated pool honors an explicit parallelism budget without
            // reconfiguring the global one.
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .build()
            {
                Ok(pool) => pool.install(|| lines.par_sort_unstable_by(by_key)),
                Err(_) => lines.par_sort_unstable_by(by_key),
            }
        } else {
            lines.par_sort_unstable_by(by_key);
        }
    }

    fn spill_run(&self, lines: &mut Vec<(usize, Vec<u8>)>) -> Result<NamedTempFile> {
        self.sort_run(lines);
        let tmp = NamedTempFile::new_in(&self.scratch_dir).map_err(|e| {
            EngineError::io(
                format!("failed to create sort run in {}", self.scratch_dir.display()),
                e,
            )
        })?;
        {
            let mut wtr = BufWriter::new(tmp.as_file());
            for (_, line) in lines.iter() {
                wtr.write_all(line)?;
                wtr.write_all(b"\n")?;
            }
            wtr.flush()?;
        }
        lines.clear();
        Ok(tmp)
    }

    fn merge_runs(&self, runs: &[NamedTempFile], out: &mut GzLineWriter) -> Result<()> {
        let mut sources: Vec<LineReader<BufReader<File>>> = Vec::with_capacity(runs.len());
        for run in runs {
            let file = File::open(run.path()).map_err(|e| {
                EngineError::io(format!("failed to reopen sort run {}", run.path().display()), e)
            })?;
            sources.push(LineReader::new(BufReader::new(file)));
        }

        let mut heap: BinaryHeap<MergeEntry> = BinaryHeap::with_capacity(sources.len());
        for (src, reader) in sources.iter_mut().enumerate() {
            if reader.advance()? {
                let line = reader.line();
                heap.push(MergeEntry {
                    key_start: key_start(line, self.key_field),
                    line: line.to_vec(),
                    src,
                });
            }
        }

        let mut last: Option<Vec<u8>> = None;
        while let Some(entry) = heap.pop() {
            if sources[entry.src].advance()? {
                let line = sources[entry.src].line();
                heap.push(MergeEntry {
                    key_start: key_start(line, self.key_field),
                    line: line.to_vec(),
                    src: entry.src,
                });
            }
            if self.unique && last.as_deref() == Some(entry.line.as_slice()) {
                continue;
            }
            out.write_line(&entry.line)?;
            if self.unique {
                last = Some(entry.line);
            }
        }
        Ok(())
    }
}

/// Byte offset where the sort key begins: just past the `key_field`-th tab.
fn key_start(line: &[u8], key_field: usize) -> usize {
    if key_field == 0 {
        return 0;
    }
    let mut seen = 0;
    for (i, &b) in line.iter().enumerate() {
        if b == b'\t' {
            seen += 1;
            if seen == key_field {
                return i + 1;
            }
        }
    }
    line.len()
}

fn cmp_keyed(a: &[u8], ka: usize, b: &[u8], kb: usize) -> Ordering {
    a[ka..].cmp(&b[kb..]).then_with(|| a.cmp(b))
}

struct MergeEntry {
    line: Vec<u8>,
    key_start: usize,
    src: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    // Reversed so the max-heap pops the smallest line first.
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_keyed(&other.line, other.key_start, &self.line, self.key_start)
            .then_with(|| other.src.cmp(&self.src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_gz(path: &Path, lines: &[&[u8]]) {
        let mut w = GzLineWriter::create(path).unwrap();
        for line in lines {
            w.write_line(line).unwrap();
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
    fn sorts_whole_lines_bytewise() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let output = dir.path().join("out.gz");
        write_gz(&input, &[b"TTTT\tx", b"AAAA\tz", b"CCCC\ty"]);

        ExternalSorter::new(dir.path()).sort_file(&input, &output).unwrap();
        assert_eq!(
            read_gz(&output),
            vec![b"AAAA\tz".to_vec(), b"CCCC\ty".to_vec(), b"TTTT\tx".to_vec()]
        );
    }

    #[test]
    fn key_field_sorts_by_later_column() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let output = dir.path().join("out.gz");
        write_gz(
            &input,
            &[b"zzz\t00000000002", b"aaa\t00000000010", b"mmm\t00000000001"],
        );

        ExternalSorter::new(dir.path())
            .key_field(1)
            .sort_file(&input, &output)
            .unwrap();
        let sorted = read_gz(&output);
        assert_eq!(sorted[0], b"mmm\t00000000001");
        assert_eq!(sorted[1], b"zzz\t00000000002");
        assert_eq!(sorted[2], b"aaa\t00000000010");
    }

    #[test]
    fn unique_drops_duplicate_lines() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let output = dir.path().join("out.gz");
        write_gz(&input, &[b"b", b"a", b"b", b"a", b"c"]);

        ExternalSorter::new(dir.path())
            .unique()
            .sort_file(&input, &output)
            .unwrap();
        assert_eq!(
            read_gz(&output),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn tiny_budget_spills_and_merges_correctly() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gz");
        let output = dir.path().join("out.gz");

        let mut expected: Vec<Vec<u8>> = Vec::new();
        {
            let mut w = GzLineWriter::create(&input).unwrap();
            for i in 0..5000u32 {
                let line = format!("{:05}\tpayload", i.wrapping_mul(2654435761) % 10007);
                w.write_line(line.as_bytes()).unwrap();
                expected.push(line.into_bytes());
            }
            w.finish().unwrap();
        }
        expected.sort();

        // Budget clamps to 64 KiB, forcing several spilled runs.
        ExternalSorter::new(dir.path())
            .memory_budget(0)
            .sort_file(&input, &output)
            .unwrap();
        assert_eq!(read_gz(&output), expected);
    }

    #[test]
    fn merges_multiple_inputs() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.gz");
        let b = dir.path().join("b.gz");
        let output = dir.path().join("out.gz");
        write_gz(&a, &[b"m", b"a"]);
        write_gz(&b, &[b"z", b"b"]);

        ExternalSorter::new(dir.path())
            .sort_files(&[a, b], &output)
            .unwrap();
        assert_eq!(
            read_gz(&output),
            vec![b"a".to_vec(), b"b".to_vec(), b"m".to_vec(), b"z".to_vec()]
        );
    }
}
