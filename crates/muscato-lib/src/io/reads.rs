//! Sequencing-read reader.
//!
//! Reads arrive as FASTQ (4 lines per record) or FASTA (header plus one or
//! more sequence lines); the format is detected from the first byte. Only
//! the name and sequence are kept — quality scores play no role in matching.

use std::io::BufRead;

use anyhow::{bail, Result};

use super::lines::LineReader;

/// One input read: identifier and raw sequence bytes. The leading `@` / `>`
/// marker is stripped from the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqRecord {
    pub name: Vec<u8>,
    pub seq: Vec<u8>,
}

/// Replace any byte other than A/T/G/C with X, in place.
pub fn mask_non_acgt(seq: &mut [u8]) {
    for b in seq.iter_mut() {
        match *b {
            b'A' | b'T' | b'G' | b'C' => {}
            _ => *b = b'X',
        }
    }
}

enum Format {
    Fastq,
    Fasta,
    Unknown,
}

pub struct SeqReader<R> {
    lines: LineReader<R>,
    format: Format,
    /// FASTA header read past the end of the previous record.
    pending: Option<Vec<u8>>,
}

impl<R: BufRead> SeqReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LineReader::new(reader),
            format: Format::Unknown,
            pending: None,
        }
    }

    /// Read the next record; `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<SeqRecord>> {
        if matches!(self.format, Format::Unknown) {
            if !self.lines.advance()? {
                return Ok(None);
            }
            match self.lines.line().first() {
                Some(b'@') => self.format = Format::Fastq,
                Some(b'>') => self.format = Format::Fasta,
                _ => bail!("unrecognized read file format: expected FASTQ or FASTA"),
            }
            self.pending = Some(self.lines.line().to_vec());
        }
        match self.format {
            Format::Fastq => self.next_fastq(),
            Format::Fasta => self.next_fasta(),
            Format::Unknown => unreachable!("format resolved above"),
        }
    }

    fn next_fastq(&mut self) -> Result<Option<SeqRecord>> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => {
                if !self.lines.advance()? {
                    return Ok(None);
                }
                self.lines.line().to_vec()
            }
        };
        if header.first() != Some(&b'@') {
            bail!(
                "invalid FASTQ: expected '@' header at line {}",
                self.lines.line_number()
            );
        }
        if !self.lines.advance()? {
            bail!("invalid FASTQ: missing sequence line");
        }
        let seq = self.lines.line().to_vec();
        if !self.lines.advance()? || self.lines.line().first() != Some(&b'+') {
            bail!(
                "invalid FASTQ: expected '+' separator at line {}",
                self.lines.line_number()
            );
        }
        if !self.lines.advance()? {
            bail!("invalid FASTQ: missing quality line");
        }
        Ok(Some(SeqRecord {
            name: header[1..].to_vec(),
            seq,
        }))
    }

    fn next_fasta(&mut self) -> Result<Option<SeqRecord>> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => return Ok(None),
        };
        let mut seq = Vec::new();
        while self.lines.advance()? {
            if self.lines.line().first() == Some(&b'>') {
                self.pending = Some(self.lines.line().to_vec());
                break;
            }
            seq.extend_from_slice(self.lines.line());
        }
        Ok(Some(SeqRecord {
            name: header[1..].to_vec(),
            seq,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fastq_parsing() {
        let data = b"@r0\nACGT\n+\nIIII\n@r1\nTGCA\n+\nJJJJ\n";
        let mut rdr = SeqReader::new(Cursor::new(&data[..]));
        let rec = rdr.next_record().unwrap().unwrap();
        assert_eq!(rec.name, b"r0");
        assert_eq!(rec.seq, b"ACGT");
        let rec = rdr.next_record().unwrap().unwrap();
        assert_eq!(rec.name, b"r1");
        assert!(rdr.next_record().unwrap().is_none());
    }

    #[test]
    fn fasta_parsing_joins_wrapped_lines() {
        let data = b">s1 description\nACGT\nACGT\n>s2\nTTTT\n";
        let mut rdr = SeqReader::new(Cursor::new(&data[..]));
        let rec = rdr.next_record().unwrap().unwrap();
        assert_eq!(rec.name, b"s1 description");
        assert_eq!(rec.seq, b"ACGTACGT");
        let rec = rdr.next_record().unwrap().unwrap();
        assert_eq!(rec.seq, b"TTTT");
        assert!(rdr.next_record().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_separator() {
        let data = b"@r0\nACGT\nBAD\nIIII\n";
        let mut rdr = SeqReader::new(Cursor::new(&data[..]));
        assert!(rdr.next_record().is_err());
    }

    #[test]
    fn empty_input_yields_no_records() {
        let mut rdr = SeqReader::new(Cursor::new(&b""[..]));
        assert!(rdr.next_record().unwrap().is_none());
    }

    #[test]
    fn masking_replaces_ambiguity_codes() {
        let mut seq = b"ACGTNRYacgt".to_vec();
        mask_non_acgt(&mut seq);
        assert_eq!(seq, b"ACGTXXXXXXX");
    }
}
