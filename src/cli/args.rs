use clap::Parser;
use crate::config::defs::{DEFAULT_SEED, DEFAULT_THREADS};

/// Slow-pass alignment selection, passed to `bfast postprocess -a`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum SelectionPolicy {
    /// Keep only reads with a unique best alignment (mode 2).
    UniqueOnly,
    /// Report the best-scoring alignment even when tied (mode 3).
    #[default]
    BestScore,
}

impl SelectionPolicy {
    pub fn from_mode(mode: u8) -> Option<Self> {
        match mode {
            2 => Some(SelectionPolicy::UniqueOnly),
            3 => Some(SelectionPolicy::BestScore),
            _ => None,
        }
    }

    pub fn mode(&self) -> u8 {
        match self {
            SelectionPolicy::UniqueOnly => 2,
            SelectionPolicy::BestScore => 3,
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "triage-align",
    version,
    about = "Two-pass colour-space alignment: fast bowtie pass, bfast on the leftovers, merged and recalibrated with samtools"
)]
pub struct Arguments {

    #[arg(short = 'r', long = "reference", help = "Reference FASTA (bfast-indexed, used by calmd)")]
    pub reference: Option<String>,

    #[arg(short = 'o', long = "output", help = "Output prefix; every artifact is written as <prefix>.<ext>")]
    pub output: Option<String>,

    #[arg(short = 't', long, default_value_t = DEFAULT_THREADS)]
    pub threads: usize,

    #[arg(
        short = 'm',
        long = "mode",
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(2..=3),
        help = "bfast postprocess selection: 3 = best score even if tied, 2 = unique best only"
    )]
    pub mode: u8,

    #[arg(value_name = "READS", help = "Colour-space reads (csfasta)")]
    pub reads: Option<String>,

    #[arg(value_name = "QUALS", help = "Per-colour qualities (qual)")]
    pub quals: Option<String>,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, help = "Colour-space bowtie index basename; defaults to the reference path without its FASTA extension")]
    pub bowtie_index: Option<String>,

    #[arg(long, default_value_t = DEFAULT_SEED, help = "Fixed bowtie seed for deterministic tie-breaking")]
    pub seed: u64,

    #[arg(long, default_value_t = 2)]
    pub max_mismatches: u8,

    #[arg(long, default_value_t = 384, help = "bfast match: maximum candidate placements per read")]
    pub max_candidates: usize,

    #[arg(long, default_value_t = 10, help = "bfast postprocess: minimum mapping quality")]
    pub min_mapq: i32,

    #[arg(long, default_value_t = 5, help = "Trimming moving-average window (colours)")]
    pub window: usize,

    #[arg(long, default_value_t = 20.0, help = "Trimming: minimum mean quality over the window")]
    pub window_quality: f64,

    #[arg(long, default_value_t = 10, help = "Trimming: minimum per-colour quality at the 3' end")]
    pub min_quality: i32,

    #[arg(long, default_value_t = 25, help = "Trimming: reads shorter than this many colours are dropped")]
    pub min_length: usize,

    #[arg(long, help = "samtools sort -m value (e.g. 768M); derived from available RAM when absent")]
    pub sort_memory: Option<String>,

    #[arg(long, default_value_t = false)]
    pub keep_intermediates: bool,

    #[arg(long, default_value_t = false, help = "Check that no diverted read was also placed by the fast pass")]
    pub verify_triage: bool,

    #[arg(long, default_value_t = false, help = "Log the stage plan without running anything")]
    pub dry_run: bool,

    #[arg(long, default_value_t = false)]
    pub skip_tool_check: bool,

    #[arg(long)]
    pub bowtie_bin: Option<String>,

    #[arg(long)]
    pub bfast_bin: Option<String>,

    #[arg(long)]
    pub samtools_bin: Option<String>,
}

impl Arguments {
    /// Names of the required flags and positionals that were not given.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.reference.is_none() {
            missing.push("--reference");
        }
        if self.output.is_none() {
            missing.push("--output");
        }
        if self.reads.is_none() {
            missing.push("READS");
        }
        if self.quals.is_none() {
            missing.push("QUALS");
        }
        missing
    }
}
