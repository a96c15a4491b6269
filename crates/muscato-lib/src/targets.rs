//! Target preprocessing.
//!
//! Converts a raw target collection (FASTA, or `name \t sequence` text,
//! optionally gzipped) into the engine's two inputs: the sequence stream
//! (one canonicalized sequence per line) and the id dictionary mapping the
//! 11-digit serial id to the target name and length. With `reverse` set,
//! every target is followed by its reverse complement under the name
//! `<name>_r`; serials count synthetics so the id always equals the
//! zero-based line number of the sequence stream.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::io::lines::{GzLineWriter, LineReader};
use crate::io::open_text_reader;
use crate::io::reads::mask_non_acgt;

/// Reverse complement over the engine alphabet. Must be applied after
/// canonicalization: anything that is not A/T/G/C maps to X.
pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'G' => b'C',
            b'C' => b'G',
            _ => b'X',
        })
        .collect()
}

struct DictWriter {
    wtr: GzLineWriter,
    serial: u64,
    record: Vec<u8>,
}

impl DictWriter {
    fn write_entry(&mut self, name: &[u8], suffix: &str, len: usize) -> Result<()> {
        self.record.clear();
        self.record
            .extend_from_slice(format!("{:011}\t", self.serial).as_bytes());
        self.record.extend_from_slice(name);
        self.record
            .extend_from_slice(format!("{suffix}\t{len}").as_bytes());
        self.wtr.write_line(&self.record)?;
        self.serial += 1;
        Ok(())
    }
}

/// Preprocess `input` into `seq_out` (sequence stream) and `id_out`
/// (id dictionary). Returns the number of sequence lines written.
pub fn prepare_targets(
    input: &Path,
    seq_out: &Path,
    id_out: &Path,
    reverse: bool,
) -> Result<u64> {
    info!("preprocessing targets from {}", input.display());

    let mut reader = LineReader::new(open_text_reader(input)?);
    let mut seqs = GzLineWriter::create(seq_out)?;
    let mut ids = DictWriter {
        wtr: GzLineWriter::create(id_out)?,
        serial: 0,
        record: Vec::new(),
    };

    let emit = |name: &[u8], seq: &mut Vec<u8>, seqs: &mut GzLineWriter, ids: &mut DictWriter| -> Result<()> {
        mask_non_acgt(seq);
        seqs.write_line(seq)?;
        ids.write_entry(name, "", seq.len())?;
        if reverse {
            let rc = revcomp(seq);
            seqs.write_line(&rc)?;
            ids.write_entry(name, "_r", rc.len())?;
        }
        Ok(())
    };

    if !reader.advance()? {
        anyhow::bail!("target file {} is empty", input.display());
    }
    let first = reader.line().to_vec();

    if first.first() == Some(&b'>') {
        // FASTA: headers introduce records, sequence lines may wrap.
        let mut name = first[1..].to_vec();
        let mut seq: Vec<u8> = Vec::new();
        while reader.advance()? {
            let line = reader.line();
            if line.first() == Some(&b'>') {
                let next_name = line[1..].to_vec();
                emit(&name, &mut seq, &mut seqs, &mut ids)?;
                name = next_name;
                seq.clear();
            } else {
                seq.extend_from_slice(line);
            }
        }
        emit(&name, &mut seq, &mut seqs, &mut ids)?;
    } else {
        // Text: one `name \t sequence` record per line.
        let mut line = first;
        loop {
            let mut split = line.splitn(2, |&b| b == b'\t');
            let name = split.next().unwrap_or_default().to_vec();
            let mut seq = match split.next() {
                Some(s) => s.to_vec(),
                None => anyhow::bail!(
                    "{}: expected two tab-delimited fields at line {}",
                    input.display(),
                    reader.line_number()
                ),
            };
            emit(&name, &mut seq, &mut seqs, &mut ids)?;
            if !reader.advance()? {
                break;
            }
            line = reader.line().to_vec();
        }
    }

    let written = ids.serial;
    seqs.finish()?;
    ids.wtr.finish()?;
    info!("wrote {written} target sequences");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lines::{open_gz_reader, split_fields};
    use tempfile::TempDir;

    fn read_gz(path: &Path) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rdr = LineReader::new(open_gz_reader(path).unwrap());
        while rdr.advance().unwrap() {
            out.push(rdr.line().to_vec());
        }
        out
    }

    #[test]
    fn revcomp_is_an_involution_on_acgt() {
        assert_eq!(revcomp(b"ACGT"), b"ACGT");
        assert_eq!(revcomp(b"AACCG"), b"CGGTT");
        assert_eq!(revcomp(&revcomp(b"GATTACA")), b"GATTACA");
        assert_eq!(revcomp(b"AXG"), b"CXT");
    }

    #[test]
    fn fasta_targets_get_serial_ids_and_lengths() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("genes.fasta");
        std::fs::write(&input, ">g0 first\nACGT\nACGT\n>g1\nTTNTT\n").unwrap();
        let seq_out = dir.path().join("seqs.txt.gz");
        let id_out = dir.path().join("ids.txt.gz");

        let n = prepare_targets(&input, &seq_out, &id_out, false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(read_gz(&seq_out), vec![b"ACGTACGT".to_vec(), b"TTXTT".to_vec()]);

        let ids = read_gz(&id_out);
        let f0 = split_fields(&ids[0]);
        assert_eq!(f0[0], b"00000000000");
        assert_eq!(f0[1], b"g0 first");
        assert_eq!(f0[2], b"8");
        let f1 = split_fields(&ids[1]);
        assert_eq!(f1[0], b"00000000001");
        assert_eq!(f1[2], b"5");
    }

    #[test]
    fn reverse_synthetics_interleave_and_append_marker() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("genes.txt");
        std::fs::write(&input, "g0\tAACG\n").unwrap();
        let seq_out = dir.path().join("seqs.txt.gz");
        let id_out = dir.path().join("ids.txt.gz");

        let n = prepare_targets(&input, &seq_out, &id_out, true).unwrap();
        assert_eq!(n, 2);
        assert_eq!(read_gz(&seq_out), vec![b"AACG".to_vec(), b"CGTT".to_vec()]);

        let ids = read_gz(&id_out);
        assert_eq!(split_fields(&ids[0])[1], b"g0");
        assert_eq!(split_fields(&ids[1])[1], b"g0_r");
    }

    #[test]
    fn text_without_tab_is_fatal() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("genes.txt");
        std::fs::write(&input, "just_a_name_no_sequence\n").unwrap();
        let err = prepare_targets(
            &input,
            &dir.path().join("s.gz"),
            &dir.path().join("i.gz"),
            false,
        );
        assert!(err.is_err());
    }
}
