//! Two-way split of the read set between the fast and slow passes.
//!
//! The fast aligner decides the split: a read it places confidently stays in
//! its output, anything else is written to the diverted side channel and
//! becomes the only input of the slow pass. The ledger records the fast-pass
//! side so the diverted side can be checked against it.

use std::collections::HashSet;
use crate::config::defs::PipelineError;
use crate::utils::sambam::is_unmapped;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadClass {
    /// Aligned by the fast pass; kept in its output.
    Placed,
    /// Rejected by the fast pass; needs the slow pass.
    Diverted,
}

impl ReadClass {
    pub fn classify(flag: u16) -> Self {
        if is_unmapped(flag) {
            ReadClass::Diverted
        } else {
            ReadClass::Placed
        }
    }
}


#[derive(Debug, Default)]
pub struct TriageLedger {
    track_names: bool,
    placed_names: HashSet<String>,
    pub placed: u64,
    pub unplaced_records: u64,
    pub diverted: u64,
}

impl TriageLedger {
    /// `track_names` keeps every placed read name in memory so diverted reads
    /// can be checked against them; counts are kept either way.
    pub fn new(track_names: bool) -> Self {
        TriageLedger {
            track_names,
            ..Default::default()
        }
    }

    /// Records one fast-pass SAM alignment line.
    pub fn record_alignment(&mut self, qname: &str, flag: u16) -> ReadClass {
        let class = ReadClass::classify(flag);
        match class {
            ReadClass::Placed => {
                self.placed += 1;
                if self.track_names {
                    self.placed_names.insert(qname.to_string());
                }
            }
            ReadClass::Diverted => self.unplaced_records += 1,
        }
        class
    }

    /// Records a read taken from the diverted side channel.
    ///
    /// # Returns
    /// TriageOverlap when name tracking is on and the read was also placed.
    pub fn record_diverted(&mut self, read_id: &str) -> Result<(), PipelineError> {
        self.diverted += 1;
        if self.track_names && self.placed_names.contains(read_id) {
            return Err(PipelineError::TriageOverlap { read: read_id.to_string() });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ReadClass::classify(0), ReadClass::Placed);
        assert_eq!(ReadClass::classify(16), ReadClass::Placed);
        assert_eq!(ReadClass::classify(4), ReadClass::Diverted);
        assert_eq!(ReadClass::classify(4 | 16), ReadClass::Diverted);
    }

    #[test]
    fn test_disjoint_split_passes() {
        let mut ledger = TriageLedger::new(true);
        ledger.record_alignment("r1", 0);
        ledger.record_alignment("r2", 4);
        assert!(ledger.record_diverted("r2").is_ok());
        assert!(ledger.record_diverted("r3").is_ok());
        assert_eq!(ledger.placed, 1);
        assert_eq!(ledger.unplaced_records, 1);
        assert_eq!(ledger.diverted, 2);
    }

    #[test]
    fn test_overlap_detected() {
        let mut ledger = TriageLedger::new(true);
        ledger.record_alignment("r1", 16);
        match ledger.record_diverted("r1") {
            Err(PipelineError::TriageOverlap { read }) => assert_eq!(read, "r1"),
            other => panic!("expected overlap, got {:?}", other),
        }
    }

    #[test]
    fn test_untracked_ledger_only_counts() {
        let mut ledger = TriageLedger::new(false);
        ledger.record_alignment("r1", 0);
        assert!(ledger.record_diverted("r1").is_ok());
        assert_eq!(ledger.placed, 1);
        assert_eq!(ledger.diverted, 1);
    }
}
