//! Gzip line-stream codec.
//!
//! Every intermediate artifact is a gzip-compressed text stream with one
//! tab-delimited record per line. Inputs may arrive plain or gzipped;
//! `open_text_reader` sniffs the gzip magic bytes rather than trusting file
//! extensions.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::EngineError;

const IO_BUFFER_SIZE: usize = 1024 * 1024;

/// Open a gzip-compressed text file for buffered line reading.
pub fn open_gz_reader(path: &Path) -> Result<BufReader<GzDecoder<BufReader<File>>>> {
    let file = File::open(path)
        .map_err(|e| EngineError::io(format!("failed to open {}", path.display()), e))?;
    let inner = BufReader::with_capacity(IO_BUFFER_SIZE, file);
    Ok(BufReader::with_capacity(
        IO_BUFFER_SIZE,
        GzDecoder::new(inner),
    ))
}

/// Open a text file for reading, decompressing transparently when the file
/// starts with the gzip magic bytes.
pub fn open_text_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)
        .map_err(|e| EngineError::io(format!("failed to open {}", path.display()), e))?;
    let mut buffered = BufReader::with_capacity(IO_BUFFER_SIZE, file);
    let is_gzipped = {
        let peek = buffered
            .fill_buf()
            .map_err(|e| EngineError::io(format!("failed to read {}", path.display()), e))?;
        peek.len() >= 2 && peek[0] == 0x1f && peek[1] == 0x8b
    };
    if is_gzipped {
        Ok(Box::new(BufReader::with_capacity(
            IO_BUFFER_SIZE,
            GzDecoder::new(buffered),
        )))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Buffered gzip line writer. `finish` must be called to flush the gzip
/// trailer; dropping without it leaves a truncated stream.
pub struct GzLineWriter {
    inner: BufWriter<GzEncoder<File>>,
    path: std::path::PathBuf,
}

impl GzLineWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| EngineError::io(format!("failed to create {}", path.display()), e))?;
        let encoder = GzEncoder::new(file, Compression::fast());
        Ok(Self {
            inner: BufWriter::with_capacity(IO_BUFFER_SIZE, encoder),
            path: path.to_path_buf(),
        })
    }

    /// Write one record followed by a newline.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.inner
            .write_all(line)
            .and_then(|()| self.inner.write_all(b"\n"))
            .map_err(|e| EngineError::io(format!("failed to write {}", self.path.display()), e))?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let encoder = self
            .inner
            .into_inner()
            .map_err(|e| EngineError::io(format!("failed to flush {}", path.display()), e.into_error()))?;
        encoder
            .finish()
            .map_err(|e| EngineError::io(format!("failed to finish {}", path.display()), e))?;
        Ok(())
    }
}

impl Write for GzLineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Iterates the lines of a byte stream without UTF-8 validation, trimming
/// `\n` / `\r\n` and tracking the line number for diagnostics.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    line: u64,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(512),
            line: 0,
        }
    }

    /// 1-based number of the line most recently read.
    pub fn line_number(&self) -> u64 {
        self.line
    }

    /// Advance to the next line; false at end of stream.
    pub fn advance(&mut self) -> Result<bool> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| EngineError::io(format!("read failed at line {}", self.line + 1), e))?;
        if n == 0 {
            return Ok(false);
        }
        while self
            .buf
            .last()
            .is_some_and(|&b| b == b'\n' || b == b'\r')
        {
            self.buf.pop();
        }
        self.line += 1;
        Ok(true)
    }

    /// The current line, valid after `advance` returned true.
    pub fn line(&self) -> &[u8] {
        &self.buf
    }
}

/// Split a record into its tab-delimited fields.
pub fn split_fields(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b'\t').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn gz_line_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.txt.gz");

        let mut wtr = GzLineWriter::create(&path).unwrap();
        wtr.write_line(b"ACGT\t1\tr0").unwrap();
        wtr.write_line(b"TTTT\t2\tr1;r2").unwrap();
        wtr.finish().unwrap();

        let mut rdr = LineReader::new(open_gz_reader(&path).unwrap());
        assert!(rdr.advance().unwrap());
        assert_eq!(rdr.line(), b"ACGT\t1\tr0");
        assert!(rdr.advance().unwrap());
        assert_eq!(rdr.line(), b"TTTT\t2\tr1;r2");
        assert!(!rdr.advance().unwrap());
        assert_eq!(rdr.line_number(), 2);
    }

    #[test]
    fn text_reader_detects_gzip_by_magic() {
        let dir = TempDir::new().unwrap();

        let plain = dir.path().join("plain.txt");
        std::fs::write(&plain, b"hello\nworld\n").unwrap();
        let mut rdr = LineReader::new(open_text_reader(&plain).unwrap());
        assert!(rdr.advance().unwrap());
        assert_eq!(rdr.line(), b"hello");

        // Misleading name, gzipped content.
        let gz = dir.path().join("data.txt");
        let mut wtr = GzLineWriter::create(&gz).unwrap();
        wtr.write_line(b"compressed").unwrap();
        wtr.finish().unwrap();
        let mut rdr = LineReader::new(open_text_reader(&gz).unwrap());
        assert!(rdr.advance().unwrap());
        assert_eq!(rdr.line(), b"compressed");
    }

    #[test]
    fn split_fields_keeps_empty_fields() {
        let fields = split_fields(b"KEY\t\tRIGHT");
        assert_eq!(fields, vec![&b"KEY"[..], &b""[..], &b"RIGHT"[..]]);
    }
}
