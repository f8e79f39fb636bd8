//! Colour-space read I/O.
//!
//! SOLiD reads arrive as a csfasta file (primer base followed by colour calls,
//! e.g. `T0320010320`) and a parallel qual file with one integer per colour.
//! Both may open with `#` comment lines, so they are read line by line here.
//! A FASTQ file holding colour-space reads is accepted in place of the pair
//! and goes through `seq_io`.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use seq_io::fastq::{OwnedRecord as FastqOwnedRecord, Reader as FastqReader};
use crate::config::defs::PipelineError;

const COMMENT_PREFIX: char = '#';
const FASTA_PREFIX: char = '>';
const FASTQ_PREFIX: char = '@';
pub const PHRED_OFFSET: i32 = 33;
const MAX_PHRED: i32 = 93;


/// One colour-space read: primer base, then one colour per position.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorRead {
    pub id: String,
    pub seq: Vec<u8>,
    /// One quality per colour; the primer has none.
    pub quals: Vec<i32>,
}

/// Header/body records of a `>`-delimited file, skipping `#` comments.
struct FastaLike<R: BufRead> {
    reader: R,
    label: String,
    pending_header: Option<String>,
    line_number: u64,
}

impl<R: BufRead> FastaLike<R> {
    fn new(reader: R, label: &str) -> Self {
        FastaLike { reader, label: label.to_string(), pending_header: None, line_number: 0 }
    }

    fn read_line(&mut self) -> Result<Option<String>, PipelineError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Returns (id, body lines joined by `sep`).
    fn next_record(&mut self, sep: &str) -> Result<Option<(String, String)>, PipelineError> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => loop {
                match self.read_line()? {
                    None => return Ok(None),
                    Some(line) if line.is_empty() || line.starts_with(COMMENT_PREFIX) => continue,
                    Some(line) if line.starts_with(FASTA_PREFIX) => break line,
                    Some(line) => {
                        return Err(PipelineError::InvalidReadFormat(format!(
                            "{} line {}: expected '>' header, found '{}'",
                            self.label, self.line_number, line
                        )))
                    }
                }
            },
        };

        let id = header_id(&header[1..]);
        let mut body: Vec<String> = Vec::new();
        while let Some(line) = self.read_line()? {
            if line.starts_with(FASTA_PREFIX) {
                self.pending_header = Some(line);
                break;
            }
            if line.is_empty() || line.starts_with(COMMENT_PREFIX) {
                continue;
            }
            body.push(line.trim().to_string());
        }
        Ok(Some((id, body.join(sep))))
    }
}

fn header_id(head: &str) -> String {
    head.split_whitespace().next().unwrap_or_default().to_string()
}


/// Reads a csfasta + qual pair in lockstep.
pub struct CsfastaReader<R: BufRead, Q: BufRead> {
    reads: FastaLike<R>,
    quals: FastaLike<Q>,
}

impl<R: BufRead, Q: BufRead> CsfastaReader<R, Q> {
    pub fn new(reads: R, quals: Q) -> Self {
        CsfastaReader {
            reads: FastaLike::new(reads, "csfasta"),
            quals: FastaLike::new(quals, "qual"),
        }
    }

    pub fn next_read(&mut self) -> Result<Option<ColorRead>, PipelineError> {
        let read = self.reads.next_record("")?;
        let qual = self.quals.next_record(" ")?;
        let ((id, seq), (qual_id, qual_body)) = match (read, qual) {
            (None, None) => return Ok(None),
            (Some(r), Some(q)) => (r, q),
            (Some((id, _)), None) => {
                return Err(PipelineError::InvalidReadFormat(format!("read {} has no quality record", id)))
            }
            (None, Some((id, _))) => {
                return Err(PipelineError::InvalidReadFormat(format!("quality record {} has no read", id)))
            }
        };
        if id != qual_id {
            return Err(PipelineError::InvalidReadFormat(format!(
                "read and quality records out of step: '{}' vs '{}'",
                id, qual_id
            )));
        }

        let quals = qual_body
            .split_whitespace()
            .map(|q| {
                q.parse::<i32>()
                    .map_err(|e| PipelineError::InvalidReadFormat(format!("read {}: bad quality '{}': {}", id, q, e)))
            })
            .collect::<Result<Vec<i32>, PipelineError>>()?;

        let colors = seq.len().saturating_sub(1);
        if quals.len() != colors {
            return Err(PipelineError::InvalidReadFormat(format!(
                "read {}: {} colours but {} qualities",
                id,
                colors,
                quals.len()
            )));
        }
        Ok(Some(ColorRead { id, seq: seq.into_bytes(), quals }))
    }
}


impl TryFrom<FastqOwnedRecord> for ColorRead {
    type Error = PipelineError;

    fn try_from(record: FastqOwnedRecord) -> Result<Self, Self::Error> {
        let id = header_id(&String::from_utf8_lossy(&record.head));
        let colors = record.seq.len().saturating_sub(1);
        let mut quals: Vec<i32> = record.qual.iter().map(|&b| b as i32 - PHRED_OFFSET).collect();
        // Some writers emit a placeholder quality for the primer base.
        if quals.len() == colors + 1 && colors > 0 {
            quals.remove(0);
        }
        if quals.len() != colors {
            return Err(PipelineError::InvalidReadFormat(format!(
                "FASTQ read {}: {} colours but {} qualities",
                id,
                colors,
                quals.len()
            )));
        }
        Ok(ColorRead { id, seq: record.seq, quals })
    }
}


/// Reads colour-space FASTQ (Phred+33).
pub struct ColorFastqReader<R: Read> {
    reader: FastqReader<R>,
}

impl<R: Read> ColorFastqReader<R> {
    pub fn new(reader: R) -> Self {
        ColorFastqReader { reader: FastqReader::new(reader) }
    }

    pub fn next_read(&mut self) -> Result<Option<ColorRead>, PipelineError> {
        match self.reader.next() {
            None => Ok(None),
            Some(Err(e)) => Err(PipelineError::InvalidReadFormat(format!("FASTQ: {}", e))),
            Some(Ok(record)) => ColorRead::try_from(record.to_owned_record()).map(Some),
        }
    }
}


/// Either reader behind one interface.
pub enum ColorReadSource {
    Csfasta(CsfastaReader<BufReader<File>, BufReader<File>>),
    Fastq(ColorFastqReader<BufReader<File>>),
}

impl ColorReadSource {
    pub fn next_read(&mut self) -> Result<Option<ColorRead>, PipelineError> {
        match self {
            ColorReadSource::Csfasta(r) => r.next_read(),
            ColorReadSource::Fastq(r) => r.next_read(),
        }
    }
}

/// Opens a read file, choosing FASTQ when its first data line starts with `@`.
///
/// # Arguments
///
/// * `reads` - csfasta or FASTQ file.
/// * `quals` - qual file; required for csfasta, ignored for FASTQ.
///
/// # Returns
/// ColorReadSource positioned at the first record.
pub fn open_color_reads(reads: &Path, quals: Option<&Path>) -> Result<ColorReadSource, PipelineError> {
    let open = |p: &Path| {
        File::open(p)
            .map(BufReader::new)
            .map_err(|e| PipelineError::IOError(format!("cannot open {}: {}", p.display(), e)))
    };

    if first_data_char(reads)? == Some(FASTQ_PREFIX) {
        return Ok(ColorReadSource::Fastq(ColorFastqReader::new(open(reads)?)));
    }
    let quals = quals.ok_or_else(|| {
        PipelineError::InvalidReadFormat(format!("{} is csfasta but no qual file was given", reads.display()))
    })?;
    Ok(ColorReadSource::Csfasta(CsfastaReader::new(open(reads)?, open(quals)?)))
}

fn first_data_char(path: &Path) -> Result<Option<char>, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::IOError(format!("cannot open {}: {}", path.display(), e)))?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with(COMMENT_PREFIX) {
            continue;
        }
        return Ok(trimmed.chars().next());
    }
    Ok(None)
}


/// Writes a colour-space FASTQ record: primer + colours, then one Phred+33 char per colour.
pub fn write_color_fastq_record<W: Write>(writer: &mut W, id: &str, seq: &[u8], quals: &[i32]) -> std::io::Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(id.as_bytes())?;
    writer.write_all(b"\n")?;

    writer.write_all(seq)?;
    writer.write_all(b"\n")?;

    writer.write_all(b"+\n")?;

    let encoded: Vec<u8> = quals
        .iter()
        .map(|&q| (q.clamp(0, MAX_PHRED) + PHRED_OFFSET) as u8)
        .collect();
    writer.write_all(&encoded)?;
    writer.write_all(b"\n")?;
    Ok(())
}
