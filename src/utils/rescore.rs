//! Mapping-quality rescoring of the fast-pass SAM stream.
//!
//! Rules are checked against the optional tag columns of each alignment line:
//!
//! 1. a perfect hit (`NM:i:0` and `CM:i:0`) gets a fixed bonus and nothing else;
//! 2. otherwise every penalty rule is tested in order and all matching deltas apply;
//! 3. a single colour mismatch (`CM:i:1`, not `CM:i:1x`) then forces MAPQ to 1;
//! 4. the result is floored at 0.
//!
//! Penalty rules match on tag prefix, so `CM:i:1` also fires for `CM:i:12`.
//! The `NM:i:1` rule appears twice (-3 and -6); both apply.

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use crate::config::defs::PipelineError;
use crate::utils::sambam::{is_header_line, SamLine};
use crate::utils::streams::ParseOutput;
use crate::utils::triage::{ReadClass, TriageLedger};

pub const PERFECT_HIT_BONUS: i64 = 10;
pub const PERFECT_HIT_TAGS: [&str; 2] = ["NM:i:0", "CM:i:0"];
pub const SINGLE_COLOR_MISMATCH_TAG: &str = "CM:i:1";
pub const SINGLE_COLOR_MISMATCH_MAPQ: i64 = 1;
/// Largest MAPQ the SAM format defines; the bonus is not capped at it.
pub const SAM_MAX_MAPQ: i64 = 255;


/// A tag prefix and the MAPQ delta applied when any tag column starts with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyRule {
    pub tag: &'static str,
    pub delta: i64,
}

impl PenaltyRule {
    pub fn matches(&self, tags: &[&str]) -> bool {
        tags.iter().any(|t| t.starts_with(self.tag))
    }
}

pub const PENALTY_RULES: [PenaltyRule; 12] = [
    PenaltyRule { tag: "NM:i:1", delta: -3 },
    PenaltyRule { tag: "XA:i:1", delta: -3 },
    PenaltyRule { tag: "NM:i:1", delta: -6 },
    PenaltyRule { tag: "CM:i:1", delta: -2 },
    PenaltyRule { tag: "CM:i:2", delta: -6 },
    PenaltyRule { tag: "CM:i:3", delta: -9 },
    PenaltyRule { tag: "CM:i:4", delta: -12 },
    PenaltyRule { tag: "CM:i:5", delta: -15 },
    PenaltyRule { tag: "CM:i:6", delta: -18 },
    PenaltyRule { tag: "CM:i:7", delta: -20 },
    PenaltyRule { tag: "CM:i:8", delta: -22 },
    PenaltyRule { tag: "CM:i:9", delta: -24 },
];


/// Which branch of the rules decided a record's new MAPQ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RescoreOutcome {
    Boosted,
    Penalized { floored: bool },
    Overridden,
}

fn has_tag(tags: &[&str], tag: &str) -> bool {
    tags.iter().any(|t| t.starts_with(tag))
}

/// `CM:i:1` followed by a non-digit or the end of the column.
fn has_single_color_mismatch(tags: &[&str]) -> bool {
    tags.iter().any(|t| {
        t.strip_prefix(SINGLE_COLOR_MISMATCH_TAG)
            .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_digit()))
    })
}


/// Computes the new MAPQ for an alignment from its tag columns.
///
/// # Arguments
///
/// * `mapq` - Original MAPQ reported by the aligner.
/// * `tags` - Optional `TAG:TYPE:VALUE` columns of the record.
///
/// # Returns
/// (new MAPQ, which branch applied)
pub fn rescore_mapq(mapq: i64, tags: &[&str]) -> (i64, RescoreOutcome) {
    if PERFECT_HIT_TAGS.iter().all(|t| has_tag(tags, t)) {
        return (mapq + PERFECT_HIT_BONUS, RescoreOutcome::Boosted);
    }

    let mut score = mapq;
    for rule in PENALTY_RULES.iter() {
        if rule.matches(tags) {
            score += rule.delta;
        }
    }

    if has_single_color_mismatch(tags) {
        return (SINGLE_COLOR_MISMATCH_MAPQ, RescoreOutcome::Overridden);
    }

    if score < 0 {
        (0, RescoreOutcome::Penalized { floored: true })
    } else {
        (score, RescoreOutcome::Penalized { floored: false })
    }
}


#[derive(Debug, Default, Clone, PartialEq)]
pub struct RescoreStats {
    pub header_lines: u64,
    pub records: u64,
    pub boosted: u64,
    pub penalized: u64,
    pub overridden: u64,
    pub floored: u64,
    pub above_sam_max: u64,
    pub unmapped: u64,
}

impl RescoreStats {
    pub fn log_summary(&self) {
        info!(
            "Rescored {} fast-pass records ({} header lines): {} boosted, {} penalized ({} floored at 0), {} forced to MAPQ {}, {} unmapped",
            self.records,
            self.header_lines,
            self.boosted,
            self.penalized,
            self.floored,
            self.overridden,
            SINGLE_COLOR_MISMATCH_MAPQ,
            self.unmapped
        );
        if self.above_sam_max > 0 {
            warn!("{} rescored records carry a MAPQ above {}", self.above_sam_max, SAM_MAX_MAPQ);
        }
    }
}


/// Rescoring state carried across lines of one stream.
#[derive(Debug, Default)]
pub struct RescoreFilter {
    pub stats: RescoreStats,
    pub ledger: TriageLedger,
    line_number: u64,
}

impl RescoreFilter {
    pub fn new(ledger: TriageLedger) -> Self {
        RescoreFilter { ledger, ..Default::default() }
    }

    /// Rescores one raw line. Header lines are forwarded without UTF-8 decoding.
    pub fn process_bytes(&mut self, bytes: Vec<u8>) -> Result<Vec<u8>, PipelineError> {
        if bytes.first() == Some(&b'@') {
            self.line_number += 1;
            self.stats.header_lines += 1;
            return Ok(bytes);
        }
        let line = String::from_utf8_lossy(&bytes);
        self.process_line(&line).map(String::into_bytes)
    }

    /// Rescores one line. Header and blank lines come back unchanged.
    ///
    /// # Arguments
    ///
    /// * `line` - One SAM line, with or without its `\n`.
    ///
    /// # Returns
    /// The line to emit, terminator preserved.
    pub fn process_line(&mut self, line: &str) -> Result<String, PipelineError> {
        self.line_number += 1;
        let (body, terminator) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };

        if is_header_line(body) {
            self.stats.header_lines += 1;
            return Ok(line.to_string());
        }
        if body.is_empty() {
            return Ok(line.to_string());
        }

        let invalid = |e: anyhow::Error| PipelineError::InvalidSamRecord { line: self.line_number, reason: e.to_string() };
        let record = SamLine::parse(body).map_err(invalid)?;
        let flag = record.flag().map_err(invalid)?;
        let mapq = record.mapq().map_err(invalid)?;

        self.stats.records += 1;
        if self.ledger.record_alignment(record.qname(), flag) == ReadClass::Diverted {
            self.stats.unmapped += 1;
        }

        let (new_mapq, outcome) = rescore_mapq(mapq, record.tags());
        match outcome {
            RescoreOutcome::Boosted => self.stats.boosted += 1,
            RescoreOutcome::Overridden => self.stats.overridden += 1,
            RescoreOutcome::Penalized { floored } => {
                self.stats.penalized += 1;
                if floored {
                    self.stats.floored += 1;
                }
            }
        }

        if new_mapq > SAM_MAX_MAPQ {
            if self.stats.above_sam_max == 0 {
                warn!(
                    "Line {}: MAPQ {} of {} is above the SAM maximum of {}",
                    self.line_number,
                    new_mapq,
                    record.qname(),
                    SAM_MAX_MAPQ
                );
            }
            self.stats.above_sam_max += 1;
        }

        let mut out = record.with_mapq(new_mapq);
        out.push_str(terminator);
        Ok(out)
    }
}


/// Runs the rescoring filter between two line channels.
///
/// # Arguments
///
/// * `input_rx` - Fast-pass SAM lines.
/// * `buffer_size` - Capacity of the output channel.
/// * `ledger` - Triage ledger, returned with the placed reads recorded.
///
/// # Returns
/// Receiver of rescored lines, and a task resolving to the filter state.
pub fn spawn_rescore_filter(
    input_rx: mpsc::Receiver<ParseOutput>,
    buffer_size: usize,
    ledger: TriageLedger,
) -> (mpsc::Receiver<ParseOutput>, JoinHandle<Result<RescoreFilter, PipelineError>>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let task = tokio::spawn(async move {
        let mut filter = RescoreFilter::new(ledger);
        let mut lines = ReceiverStream::new(input_rx);
        while let Some(ParseOutput::Bytes(bytes)) = lines.next().await {
            let rescored = filter.process_bytes(bytes)?;
            if tx.send(ParseOutput::Bytes(rescored)).await.is_err() {
                // Consumer gone; its exit status carries the failure.
                break;
            }
        }
        Ok(filter)
    });
    (rx, task)
}
