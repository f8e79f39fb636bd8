use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use log::debug;
use crate::config::defs::{
    BAM_INDEX_EXT, BFAST_ALIGNMENTS, BFAST_BAM, BFAST_MATCHES, BFAST_UNSORTED_BAM, BOWTIE_BAM,
    BOWTIE_UN, BOWTIE_UN_QUAL, BOWTIE_UNSORTED_BAM, CALMD_BAM, FASTA_EXTS, MERGE_BAM,
    MERGE_HEADER, TRIMMED_FASTQ,
};


/// Every file the pipeline writes, rooted at the output prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub prefix: PathBuf,
    pub bowtie_unsorted_bam: PathBuf,
    pub bowtie_bam: PathBuf,
    pub bowtie_un: PathBuf,
    pub bowtie_un_qual: PathBuf,
    pub trimmed_fastq: PathBuf,
    pub bfast_matches: PathBuf,
    pub bfast_alignments: PathBuf,
    pub bfast_unsorted_bam: PathBuf,
    pub bfast_bam: PathBuf,
    pub header: PathBuf,
    pub merge_bam: PathBuf,
    pub merge_bai: PathBuf,
    pub calmd_bam: PathBuf,
    pub calmd_bai: PathBuf,
}

impl Artifacts {
    pub fn new(prefix: &Path) -> Self {
        let merge_bam = with_suffix(prefix, MERGE_BAM);
        let calmd_bam = with_suffix(prefix, CALMD_BAM);
        Artifacts {
            prefix: prefix.to_path_buf(),
            bowtie_unsorted_bam: with_suffix(prefix, BOWTIE_UNSORTED_BAM),
            bowtie_bam: with_suffix(prefix, BOWTIE_BAM),
            bowtie_un: with_suffix(prefix, BOWTIE_UN),
            bowtie_un_qual: with_suffix(prefix, BOWTIE_UN_QUAL),
            trimmed_fastq: with_suffix(prefix, TRIMMED_FASTQ),
            bfast_matches: with_suffix(prefix, BFAST_MATCHES),
            bfast_alignments: with_suffix(prefix, BFAST_ALIGNMENTS),
            bfast_unsorted_bam: with_suffix(prefix, BFAST_UNSORTED_BAM),
            bfast_bam: with_suffix(prefix, BFAST_BAM),
            header: with_suffix(prefix, MERGE_HEADER),
            merge_bai: with_suffix(&merge_bam, BAM_INDEX_EXT),
            merge_bam,
            calmd_bai: with_suffix(&calmd_bam, BAM_INDEX_EXT),
            calmd_bam,
        }
    }

    /// Directory holding the prefix; created before the first stage runs.
    pub fn out_dir(&self) -> PathBuf {
        match self.prefix.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}


/// Appends `.<suffix>` to a path without touching any existing extension.
///
/// # Arguments
///
/// * `path` - Base path, usually the output prefix.
/// * `suffix` - Text after the dot, may itself contain dots.
///
/// # Returns
/// PathBuf of `<path>.<suffix>`
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}


/// Makes a user-supplied path absolute against `cwd`.
pub fn resolve_path(path: &str, cwd: &Path) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}


/// Drops a trailing FASTA extension (`ref.fa` -> `ref`), leaving other paths as-is.
pub fn strip_fasta_extension(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if FASTA_EXTS.contains(&ext.to_ascii_lowercase().as_str()) => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}


/// Deletes files that may or may not exist.
///
/// # Returns
/// Number of files actually removed.
pub fn remove_files(paths: &[PathBuf]) -> io::Result<usize> {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}
