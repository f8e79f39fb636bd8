#![cfg(unix)]

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tempfile::{tempdir, TempDir};
use triage_align::config::defs::{PipelineError, RunConfig};
use triage_align::pipelines::triage_align::run;
use triage_align::Arguments;

// Stub aligners: "BAM" files are plain SAM text so the final output can be inspected.

const BOWTIE_STUB: &str = r#"#!/bin/sh
un=""
while [ $# -gt 0 ]; do
  case "$1" in
    --un) un="$2"; shift 2;;
    *) shift;;
  esac
done
printf '@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:chr1\tLN:1000\n'
printf 'r1\t0\tchr1\t100\t30\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXA:i:1\tMD:Z:10\tNM:i:1\tCM:i:1\n'
printf 'r2\t4\t*\t0\t0\t*\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXM:i:0\n'
printf 'r3\t4\t*\t0\t0\t*\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXM:i:2\n'
cat > "$un" <<'EOF'
__UNALIGNED__
EOF
"#;

// Places every read and, like bowtie, writes no --un file when nothing is diverted.
const BOWTIE_PLACES_ALL_STUB: &str = r#"#!/bin/sh
printf '@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:chr1\tLN:1000\n'
printf 'r1\t0\tchr1\t100\t30\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXA:i:1\tMD:Z:10\tNM:i:1\tCM:i:1\n'
printf 'r2\t0\tchr1\t200\t24\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXA:i:0\tMD:Z:10\tNM:i:0\tCM:i:0\n'
printf 'r3\t0\tchr1\t300\t24\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXA:i:0\tMD:Z:10\tNM:i:0\tCM:i:0\n'
"#;

const BFAST_STUB: &str = r#"#!/bin/sh
sub="$1"; shift
input=""
while [ $# -gt 0 ]; do
  case "$1" in
    -r|-m|-i) input="$2"; shift 2;;
    *) shift;;
  esac
done
case "$sub" in
  match) awk 'NR % 4 == 1 { print substr($1, 2) }' "$input";;
  localalign) cat "$input";;
  postprocess)
    printf '@HD\tVN:1.0\n@SQ\tSN:chr1\tLN:1000\n'
    while read name; do
      printf '%s\t0\tchr1\t50\t20\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\n' "$name"
    done < "$input";;
  *) echo "unknown subcommand $sub" >&2; exit 1;;
esac
"#;

const SAMTOOLS_STUB: &str = r#"#!/bin/sh
sub="$1"; shift
out=""; header=""; hflag=0; pos=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2;;
    -h) header="$2"; shift 2;;
    -@|-m|-F) shift 2;;
    -H) hflag=1; shift;;
    -b|-f|-E|-r) shift;;
    *) pos="$pos $1"; shift;;
  esac
done
set -- $pos
case "$sub" in
  view)
    if [ "$hflag" = 1 ]; then grep '^@' "$1"; exit 0; fi
    awk -F '\t' '/^@/ || int($2 / 4) % 2 == 0' > "$out";;
  sort) cp "$1" "$out";;
  merge)
    target="$1"; shift
    { cat "$header"; for f in "$@"; do grep -v '^@' "$f" || true; done; } > "$target";;
  index) touch "$1.bai";;
  calmd) cat "$1";;
  *) echo "unknown subcommand $sub" >&2; exit 1;;
esac
"#;

const GOOD_AND_BAD_READS: &str = "@r2\nT0123012301\n+\n??????????\n@r3\nT0123012301\n+\n##########";
const ONLY_BAD_READS: &str = "@r2\nT0123012301\n+\n#####?????\n@r3\nT0123012301\n+\n##########";


fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Workspace with reference, reads and stub tools; returns the run configuration.
fn setup(unaligned: &str, extra: &[&str]) -> Result<(TempDir, RunConfig)> {
    setup_with_bowtie(unaligned, extra, None)
}

fn setup_with_bowtie(unaligned: &str, extra: &[&str], bowtie_bin: Option<&str>) -> Result<(TempDir, RunConfig)> {
    let dir = tempdir()?;
    let bin = dir.path().join("bin");
    fs::create_dir(&bin)?;
    let bowtie = write_script(&bin, "bowtie", &BOWTIE_STUB.replace("__UNALIGNED__", unaligned))?;
    let bfast = write_script(&bin, "bfast", BFAST_STUB)?;
    let samtools = write_script(&bin, "samtools", SAMTOOLS_STUB)?;

    fs::write(dir.path().join("ref.fa"), ">chr1\nACGT\n")?;
    fs::write(dir.path().join("s1.csfasta"), ">r1\nT0123012301\n>r2\nT0123012301\n>r3\nT0123012301\n")?;
    fs::write(dir.path().join("s1.qual"), ">r1\n30 30 30 30 30 30 30 30 30 30\n")?;

    let mut argv: Vec<String> = [
        "triage-align", "-r", "ref.fa", "-o", "out/s1", "-t", "2",
        "--sort-memory", "128M", "--min-length", "5", "--skip-tool-check", "--verify-triage",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let bowtie = bowtie_bin.map(String::from).unwrap_or_else(|| bowtie.display().to_string());
    argv.extend(["--bowtie-bin".to_string(), bowtie]);
    argv.extend(["--bfast-bin".to_string(), bfast.display().to_string()]);
    argv.extend(["--samtools-bin".to_string(), samtools.display().to_string()]);
    argv.extend(extra.iter().map(|s| s.to_string()));
    argv.extend(["s1.csfasta".to_string(), "s1.qual".to_string()]);

    let config = RunConfig::new(Arguments::try_parse_from(argv)?, dir.path())?;
    Ok((dir, config))
}

/// Read name -> alignment lines in a SAM text file.
fn alignments(path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for line in fs::read_to_string(path)?.lines().filter(|l| !l.starts_with('@')) {
        let name = line.split('\t').next().unwrap_or_default().to_string();
        by_name.entry(name).or_default().push(line.to_string());
    }
    Ok(by_name)
}


#[tokio::test]
async fn test_two_pass_run() -> Result<()> {
    let (dir, config) = setup(GOOD_AND_BAD_READS, &[])?;
    let artifacts = config.artifacts.clone();
    run(Arc::new(config)).await?;

    assert!(artifacts.calmd_bam.exists());
    assert!(artifacts.calmd_bai.exists());
    assert!(artifacts.merge_bai.exists());
    assert!(!artifacts.bowtie_unsorted_bam.exists());
    assert!(!artifacts.bfast_unsorted_bam.exists());
    assert!(!artifacts.bfast_matches.exists());
    assert!(!artifacts.bfast_alignments.exists());

    // r1 placed by the fast pass, r2 by the slow pass, r3 trimmed away
    let placed = alignments(&artifacts.calmd_bam)?;
    assert_eq!(placed.len(), 2);
    assert_eq!(placed["r1"].len(), 1);
    assert_eq!(placed["r2"].len(), 1);
    assert!(!placed.contains_key("r3"));
    assert_eq!(placed["r1"][0].split('\t').nth(4), Some("1"));

    let fast = alignments(&artifacts.bowtie_bam)?;
    let slow = alignments(&artifacts.bfast_bam)?;
    assert!(fast.keys().all(|name| !slow.contains_key(name)));

    let trimmed = fs::read_to_string(&artifacts.trimmed_fastq)?;
    assert!(trimmed.contains("@r2\n"));
    assert!(!trimmed.contains("@r3\n"));

    // the bfast scratch directory goes away with the run
    let leftovers: Vec<_> = fs::read_dir(dir.path().join("out"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("bfast_tmp"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_no_residual_reads_skips_slow_pass() -> Result<()> {
    let (_dir, config) = setup(ONLY_BAD_READS, &["--keep-intermediates"])?;
    let artifacts = config.artifacts.clone();
    run(Arc::new(config)).await?;

    assert!(artifacts.calmd_bam.exists());
    assert!(!artifacts.bfast_matches.exists());
    assert!(!artifacts.bfast_bam.exists());
    let placed = alignments(&artifacts.calmd_bam)?;
    assert_eq!(placed.keys().collect::<Vec<_>>(), vec!["r1"]);
    Ok(())
}

#[tokio::test]
async fn test_rerun_overwrites() -> Result<()> {
    let (_dir, config) = setup(GOOD_AND_BAD_READS, &[])?;
    let config = Arc::new(config);
    run(config.clone()).await?;
    run(config.clone()).await?;
    let placed = alignments(&config.artifacts.calmd_bam)?;
    assert_eq!(placed.values().map(|v| v.len()).sum::<usize>(), 2);
    Ok(())
}

#[tokio::test]
async fn test_rerun_ignores_stale_unaligned_reads() -> Result<()> {
    let (dir, config) = setup(GOOD_AND_BAD_READS, &[])?;
    let config = Arc::new(config);
    run(config.clone()).await?;
    assert!(config.artifacts.bowtie_un.exists());

    write_script(&dir.path().join("bin"), "bowtie", BOWTIE_PLACES_ALL_STUB)?;
    run(config.clone()).await?;

    assert!(!config.artifacts.bowtie_un.exists());
    let placed = alignments(&config.artifacts.calmd_bam)?;
    assert_eq!(placed.len(), 3);
    assert!(placed.values().all(|lines| lines.len() == 1));
    assert_eq!(placed["r2"][0].split('\t').nth(3), Some("200"));
    Ok(())
}

#[tokio::test]
async fn test_fast_pass_failure_aborts() -> Result<()> {
    let (_dir, config) = setup_with_bowtie(GOOD_AND_BAD_READS, &[], Some("false"))?;
    let artifacts = config.artifacts.clone();
    match run(Arc::new(config)).await {
        Err(PipelineError::ToolFailed { tool, .. }) => assert_eq!(tool, "bowtie"),
        other => panic!("expected bowtie failure, got {:?}", other),
    }
    assert!(!artifacts.trimmed_fastq.exists());
    assert!(!artifacts.calmd_bam.exists());
    Ok(())
}

#[tokio::test]
async fn test_dry_run_touches_nothing() -> Result<()> {
    let (dir, config) = setup(GOOD_AND_BAD_READS, &["--dry-run"])?;
    run(Arc::new(config)).await?;
    assert!(!dir.path().join("out").exists());
    Ok(())
}
