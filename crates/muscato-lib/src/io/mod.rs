//! Stream I/O: the gzip line codec used by every intermediate artifact and
//! the sequencing-read reader.

pub mod lines;
pub mod reads;

pub use lines::{open_gz_reader, open_text_reader, GzLineWriter, LineReader};
pub use reads::{mask_non_acgt, SeqReader, SeqRecord};
