//! 3' moving-average quality trimming of colour-space reads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use log::{debug, info, warn};
use crate::config::defs::{PipelineError, TrimConfig};
use crate::utils::fastx::{open_color_reads, write_color_fastq_record, ColorRead};
use crate::utils::triage::TriageLedger;


#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrimStats {
    pub seen: u64,
    pub kept: u64,
    pub dropped: u64,
    pub colors_removed: u64,
}

impl TrimStats {
    pub fn log_summary(&self) {
        info!(
            "Trimmed {} diverted reads: {} kept, {} dropped below minimum length, {} colours removed",
            self.seen, self.kept, self.dropped, self.colors_removed
        );
    }
}


/// Number of leading colours kept after trimming.
///
/// The read is cut at the start of the first window whose mean quality is
/// below `window_quality`, then trailing colours below `min_quality` are
/// stripped. A read shorter than the window is scored as one window.
/// Negative (missing-call) qualities count as 0.
///
/// # Arguments
///
/// * `quals` - One quality per colour.
/// * `config` - Window size and thresholds.
///
/// # Returns
/// Kept length in colours, `0..=quals.len()`.
pub fn trim_length(quals: &[i32], config: &TrimConfig) -> usize {
    let len = quals.len();
    if len == 0 {
        return 0;
    }
    let q = |i: usize| quals[i].max(0) as f64;
    let window = config.window.clamp(1, len);

    let mut cut = len;
    let mut sum: f64 = (0..window).map(q).sum();
    for start in 0..=(len - window) {
        if start > 0 {
            sum += q(start + window - 1) - q(start - 1);
        }
        if sum / (window as f64) < config.window_quality {
            cut = start;
            break;
        }
    }

    while cut > 0 && quals[cut - 1].max(0) < config.min_quality {
        cut -= 1;
    }
    cut
}

/// Trims one read, or returns None when it ends up shorter than `min_length` colours.
pub fn trim_read(read: &ColorRead, config: &TrimConfig) -> Option<ColorRead> {
    let keep = trim_length(&read.quals, config);
    if keep < config.min_length || read.seq.is_empty() {
        return None;
    }
    Some(ColorRead {
        id: read.id.clone(),
        seq: read.seq[..keep + 1].to_vec(),
        quals: read.quals[..keep].to_vec(),
    })
}


/// Trims the diverted reads into one colour-space FASTQ.
///
/// A missing `reads` file means the fast pass diverted nothing: the output is
/// created empty. Each read is reported to `ledger` before trimming.
///
/// # Arguments
///
/// * `reads` - Diverted reads, csfasta or FASTQ.
/// * `quals` - Matching qual file for csfasta input.
/// * `output` - FASTQ to write.
/// * `config` - Trimming thresholds.
/// * `ledger` - Fast-pass triage ledger.
///
/// # Returns
/// TrimStats; `kept` is the number of reads handed to the slow pass.
pub fn trim_reads(
    reads: &Path,
    quals: Option<&Path>,
    output: &Path,
    config: &TrimConfig,
    ledger: &mut TriageLedger,
) -> Result<TrimStats, PipelineError> {
    let out_file = File::create(output)
        .map_err(|e| PipelineError::IOError(format!("cannot create {}: {}", output.display(), e)))?;
    let mut writer = BufWriter::new(out_file);
    let mut stats = TrimStats::default();

    if !reads.exists() {
        warn!("No diverted read file at {}; treating as empty", reads.display());
        writer.flush()?;
        return Ok(stats);
    }
    let quals = quals.filter(|q| q.exists());

    let mut source = open_color_reads(reads, quals)?;
    while let Some(read) = source.next_read()? {
        stats.seen += 1;
        ledger.record_diverted(&read.id)?;
        match trim_read(&read, config) {
            Some(trimmed) => {
                stats.kept += 1;
                stats.colors_removed += (read.quals.len() - trimmed.quals.len()) as u64;
                write_color_fastq_record(&mut writer, &trimmed.id, &trimmed.seq, &trimmed.quals)?;
            }
            None => {
                debug!("Dropping {}: shorter than {} colours after trimming", read.id, config.min_length);
                stats.dropped += 1;
                stats.colors_removed += read.quals.len() as u64;
            }
        }
    }
    writer.flush()?;
    Ok(stats)
}
