use std::path::{Path, PathBuf};
use std::collections::HashMap;
use lazy_static::lazy_static;
use thiserror::Error;
use crate::cli::{Arguments, SelectionPolicy};
use crate::utils::file::{Artifacts, resolve_path, strip_fasta_extension};
use crate::utils::system::{compute_sort_memory, detect_ram};

// External software
pub const BOWTIE_TAG: &str = "bowtie";
pub const BFAST_TAG: &str = "bfast";
pub const SAMTOOLS_TAG: &str = "samtools";


lazy_static! {
    /// Oldest (major, minor) each tool has been run with.
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(BOWTIE_TAG, (1, 0));
        m.insert(BFAST_TAG, (0, 7));
        m.insert(SAMTOOLS_TAG, (1, 10));

        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Sort,
    Merge,
    Index,
    Calmd,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Merge => "merge",
            SamtoolsSubcommand::Index => "index",
            SamtoolsSubcommand::Calmd => "calmd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BfastSubcommand {
    Match,
    LocalAlign,
    PostProcess,
}

impl BfastSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BfastSubcommand::Match => "match",
            BfastSubcommand::LocalAlign => "localalign",
            BfastSubcommand::PostProcess => "postprocess",
        }
    }
}


// Static Filenames (suffixes appended to the output prefix)
pub const BOWTIE_UNSORTED_BAM: &str = "bowtie.unsorted.bam";
pub const BOWTIE_BAM: &str = "bowtie.bam";
pub const BOWTIE_UN: &str = "bowtie.un";
pub const BOWTIE_UN_QUAL: &str = "bowtie.un.qual";
pub const TRIMMED_FASTQ: &str = "bfastq";
pub const BFAST_MATCHES: &str = "bmf";
pub const BFAST_ALIGNMENTS: &str = "baf";
pub const BFAST_UNSORTED_BAM: &str = "bfast.unsorted.bam";
pub const BFAST_BAM: &str = "bfast.bam";
pub const MERGE_HEADER: &str = "header";
pub const MERGE_BAM: &str = "merge.bam";
pub const CALMD_BAM: &str = "calmd.bam";
pub const BAM_INDEX_EXT: &str = "bai";


// Static Parameters
pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_SEED: u64 = 0;
pub const BFAST_COLOR_SPACE: &str = "1";
pub const BFAST_SAM_OUTPUT: &str = "1";
pub const SAM_UNMAPPED_FLAG: u16 = 0x4;
pub const STDERR_TAIL_LINES: usize = 20;
pub const LINE_CHANNEL_BUFFER: usize = 10_000;

pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna", "csfasta"];


/// Binaries for each external tool, defaulting to the tag looked up on PATH.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    pub bowtie: PathBuf,
    pub bfast: PathBuf,
    pub samtools: PathBuf,
}

impl ToolPaths {
    pub fn for_tool(&self, tool: &str) -> PathBuf {
        match tool {
            BOWTIE_TAG => self.bowtie.clone(),
            BFAST_TAG => self.bfast.clone(),
            SAMTOOLS_TAG => self.samtools.clone(),
            other => PathBuf::from(other),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            bowtie: PathBuf::from(BOWTIE_TAG),
            bfast: PathBuf::from(BFAST_TAG),
            samtools: PathBuf::from(SAMTOOLS_TAG),
        }
    }
}


/// Moving-average trimming policy for diverted reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimConfig {
    pub window: usize,
    pub window_quality: f64,
    pub min_quality: i32,
    pub min_length: usize,
}


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stage '{stage}' is missing input {path}")]
    MissingInput { stage: String, path: PathBuf },

    #[error("Stage '{stage}' did not produce {path}")]
    MissingOutput { stage: String, path: PathBuf },

    #[error("Tool {tool} not found: {error}")]
    ToolNotFound { tool: String, error: String },

    #[error("Tool {tool} execution error: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Tool {tool} exited with {status}{}", format_stderr_tail(.stderr_tail))]
    ToolFailed { tool: String, status: String, stderr_tail: Vec<String> },

    #[error("Invalid SAM record at line {line}: {reason}")]
    InvalidSamRecord { line: u64, reason: String },

    #[error("Invalid read input: {0}")]
    InvalidReadFormat(String),

    #[error("Read {read} was placed by the fast pass and also diverted to the slow pass")]
    TriageOverlap { read: String },

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_stderr_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("; last stderr lines:\n{}", tail.join("\n"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


pub struct RunConfig {
    pub args: Arguments,
    pub reference: PathBuf,
    pub bowtie_index: PathBuf,
    pub reads: PathBuf,
    pub quals: PathBuf,
    pub artifacts: Artifacts,
    pub policy: SelectionPolicy,
    pub tools: ToolPaths,
    pub trim: TrimConfig,
    pub sort_memory: String,
}

impl RunConfig {
    /// Resolves parsed arguments against `cwd` into a runnable configuration.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments; required fields must be present.
    /// * `cwd` - Directory relative paths are resolved against.
    ///
    /// # Returns
    /// RunConfig, or InvalidConfig when a required value is missing or out of range.
    pub fn new(args: Arguments, cwd: &Path) -> Result<Self, PipelineError> {
        let missing = args.missing_required();
        if !missing.is_empty() {
            return Err(PipelineError::InvalidConfig(format!("missing {}", missing.join(", "))));
        }
        if args.threads == 0 {
            return Err(PipelineError::InvalidConfig("--threads must be at least 1".to_string()));
        }
        if args.window == 0 {
            return Err(PipelineError::InvalidConfig("--window must be at least 1".to_string()));
        }

        // missing_required() guarantees these are Some
        let reference = resolve_path(args.reference.as_deref().unwrap_or_default(), cwd);
        let prefix = resolve_path(args.output.as_deref().unwrap_or_default(), cwd);
        let reads = resolve_path(args.reads.as_deref().unwrap_or_default(), cwd);
        let quals = resolve_path(args.quals.as_deref().unwrap_or_default(), cwd);

        let bowtie_index = match &args.bowtie_index {
            Some(index) => resolve_path(index, cwd),
            None => strip_fasta_extension(&reference),
        };

        let policy = SelectionPolicy::from_mode(args.mode)
            .ok_or_else(|| PipelineError::InvalidConfig(format!("Invalid mode: {} (expected 2 or 3)", args.mode)))?;

        let sort_memory = match &args.sort_memory {
            Some(mem) => mem.clone(),
            None => {
                let (_total_ram, available_ram) = detect_ram()?;
                compute_sort_memory(available_ram, args.threads)
            }
        };

        let tools = ToolPaths {
            bowtie: args.bowtie_bin.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(BOWTIE_TAG)),
            bfast: args.bfast_bin.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(BFAST_TAG)),
            samtools: args.samtools_bin.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(SAMTOOLS_TAG)),
        };

        let trim = TrimConfig {
            window: args.window,
            window_quality: args.window_quality,
            min_quality: args.min_quality,
            min_length: args.min_length,
        };

        Ok(RunConfig {
            reference,
            bowtie_index,
            reads,
            quals,
            artifacts: Artifacts::new(&prefix),
            policy,
            tools,
            trim,
            sort_memory,
            args,
        })
    }

    pub fn threads(&self) -> usize {
        self.args.threads
    }
}
