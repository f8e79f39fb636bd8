use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use log::{info, warn};
use crate::config::defs::{
    BfastSubcommand, PipelineError, RunConfig, SamtoolsSubcommand, BFAST_TAG, BOWTIE_TAG, SAMTOOLS_TAG,
};
use crate::utils::command::bfast::BfastConfig;
use crate::utils::command::bowtie::BowtieConfig;
use crate::utils::command::samtools::SamtoolsConfig;
use crate::utils::command::{check_versions, generate_cli, ToolInvocation};
use crate::utils::stage::{log_plan, run_stages, LineTransform, RunCondition, Stage, StageAction, StageContext, TrimJob};
use crate::utils::triage::TriageLedger;

const BFAST_TMP_PREFIX: &str = "bfast_tmp.";


fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn samtools(config: &RunConfig, samtools_config: SamtoolsConfig) -> Result<ToolInvocation, PipelineError> {
    generate_cli(config, &samtools_config)
}

/// `samtools view -b -F 4 -o <bam> -`: binary output, unmapped records dropped.
fn bam_writer(config: &RunConfig, bam: &Path) -> Result<ToolInvocation, PipelineError> {
    samtools(
        config,
        SamtoolsConfig::new(SamtoolsSubcommand::View)
            .flag("-b")
            .option("-F", "4")
            .option("-o", path_str(bam))
            .positional("-"),
    )
}

fn sort_stages(config: &RunConfig, name: &str, unsorted: &Path, sorted: &Path) -> Result<Vec<Stage>, PipelineError> {
    let sort = samtools(
        config,
        SamtoolsConfig::new(SamtoolsSubcommand::Sort)
            .option("-m", config.sort_memory.clone())
            .option("-o", path_str(sorted))
            .positional(path_str(unsorted)),
    )?;
    Ok(vec![
        Stage::new(&format!("{}_sort", name), StageAction::Tool(sort))
            .inputs(vec![unsorted.to_path_buf()])
            .outputs(vec![sorted.to_path_buf()]),
        Stage::new(&format!("{}_sort_cleanup", name), StageAction::Remove(vec![unsorted.to_path_buf()])),
    ])
}


/// Fast pass: bowtie SAM rescored on the fly into a BAM of placed reads, then sorted.
///
/// bowtie writes no `--un` file when it diverts nothing, so leftovers from an
/// earlier run under the same prefix are removed first.
fn fast_pass_stages(config: &RunConfig) -> Result<Vec<Stage>, PipelineError> {
    let artifacts = &config.artifacts;
    let bowtie = generate_cli(
        config,
        &BowtieConfig {
            index: config.bowtie_index.clone(),
            reads: config.reads.clone(),
            quals: config.quals.clone(),
            unaligned: artifacts.bowtie_un.clone(),
        },
    )?;

    let mut stages = vec![
        Stage::new(
            "bowtie_un_cleanup",
            StageAction::Remove(vec![artifacts.bowtie_un.clone(), artifacts.bowtie_un_qual.clone()]),
        ),
        Stage::new(
            "bowtie",
            StageAction::Stream {
                producer: bowtie,
                transform: LineTransform::RescoreMapq,
                consumer: bam_writer(config, &artifacts.bowtie_unsorted_bam)?,
            },
        )
        .inputs(vec![config.reads.clone(), config.quals.clone()])
        .outputs(vec![artifacts.bowtie_unsorted_bam.clone()]),
    ];

    stages.extend(sort_stages(config, BOWTIE_TAG, &artifacts.bowtie_unsorted_bam, &artifacts.bowtie_bam)?);
    Ok(stages)
}


fn trim_stage(config: &RunConfig) -> Stage {
    let artifacts = &config.artifacts;
    Stage::new(
        "trim",
        StageAction::Trim(TrimJob {
            reads: artifacts.bowtie_un.clone(),
            quals: Some(artifacts.bowtie_un_qual.clone()),
            output: artifacts.trimmed_fastq.clone(),
            config: config.trim,
        }),
    )
    .outputs(vec![artifacts.trimmed_fastq.clone()])
}


/// Slow pass over the trimmed residual reads; every stage is skipped when none are left.
fn slow_pass_stages(config: &RunConfig, tmp_dir: &Path) -> Result<Vec<Stage>, PipelineError> {
    let artifacts = &config.artifacts;

    let bfast_match = generate_cli(
        config,
        &BfastConfig {
            subcommand: BfastSubcommand::Match,
            input: artifacts.trimmed_fastq.clone(),
            tmp_dir: Some(tmp_dir.to_path_buf()),
        },
    )?
    .redirect_stdout(&artifacts.bfast_matches);

    let localalign = generate_cli(
        config,
        &BfastConfig {
            subcommand: BfastSubcommand::LocalAlign,
            input: artifacts.bfast_matches.clone(),
            tmp_dir: None,
        },
    )?
    .redirect_stdout(&artifacts.bfast_alignments);

    let postprocess = generate_cli(
        config,
        &BfastConfig {
            subcommand: BfastSubcommand::PostProcess,
            input: artifacts.bfast_alignments.clone(),
            tmp_dir: None,
        },
    )?;

    let mut stages = vec![
        Stage::new("bfast_match", StageAction::Tool(bfast_match))
            .inputs(vec![artifacts.trimmed_fastq.clone()])
            .outputs(vec![artifacts.bfast_matches.clone()]),
        Stage::new("bfast_localalign", StageAction::Tool(localalign))
            .inputs(vec![artifacts.bfast_matches.clone()])
            .outputs(vec![artifacts.bfast_alignments.clone()]),
        Stage::new(
            "bfast_postprocess",
            StageAction::Stream {
                producer: postprocess,
                transform: LineTransform::Passthrough,
                consumer: bam_writer(config, &artifacts.bfast_unsorted_bam)?,
            },
        )
        .inputs(vec![artifacts.bfast_alignments.clone()])
        .outputs(vec![artifacts.bfast_unsorted_bam.clone()]),
    ];

    if !config.args.keep_intermediates {
        stages.push(Stage::new(
            "bfast_cleanup",
            StageAction::Remove(vec![artifacts.bfast_matches.clone(), artifacts.bfast_alignments.clone()]),
        ));
    }
    stages.extend(sort_stages(config, BFAST_TAG, &artifacts.bfast_unsorted_bam, &artifacts.bfast_bam)?);

    Ok(stages
        .into_iter()
        .map(|stage| stage.when(RunCondition::ResidualReads))
        .collect())
}


/// Header extraction and merge, in a two-input and a fast-pass-only variant.
fn merge_stages(config: &RunConfig) -> Result<Vec<Stage>, PipelineError> {
    let artifacts = &config.artifacts;
    let mut stages = Vec::new();

    let variants: [(RunCondition, &PathBuf, Vec<&PathBuf>); 2] = [
        (RunCondition::ResidualReads, &artifacts.bfast_bam, vec![&artifacts.bowtie_bam, &artifacts.bfast_bam]),
        (RunCondition::NoResidualReads, &artifacts.bowtie_bam, vec![&artifacts.bowtie_bam]),
    ];
    for (condition, header_source, merge_inputs) in variants {
        let header = samtools(
            config,
            SamtoolsConfig::new(SamtoolsSubcommand::View).flag("-H").positional(path_str(header_source)),
        )?
        .redirect_stdout(&artifacts.header);
        stages.push(
            Stage::new("header", StageAction::Tool(header))
                .when(condition)
                .inputs(vec![header_source.clone()])
                .outputs(vec![artifacts.header.clone()]),
        );

        let mut merge_config = SamtoolsConfig::new(SamtoolsSubcommand::Merge)
            .flag("-f")
            .option("-h", path_str(&artifacts.header))
            .positional(path_str(&artifacts.merge_bam));
        for input in &merge_inputs {
            merge_config = merge_config.positional(path_str(input));
        }
        stages.push(
            Stage::new("merge", StageAction::Tool(samtools(config, merge_config)?))
                .when(condition)
                .inputs(merge_inputs.into_iter().cloned().chain([artifacts.header.clone()]).collect())
                .outputs(vec![artifacts.merge_bam.clone()]),
        );
    }
    Ok(stages)
}


fn finish_stages(config: &RunConfig) -> Result<Vec<Stage>, PipelineError> {
    let artifacts = &config.artifacts;
    let index = |bam: &PathBuf, bai: &PathBuf, name: &str| -> Result<Stage, PipelineError> {
        let invocation = samtools(config, SamtoolsConfig::new(SamtoolsSubcommand::Index).positional(path_str(bam)))?;
        Ok(Stage::new(name, StageAction::Tool(invocation)).inputs(vec![bam.clone()]).outputs(vec![bai.clone()]))
    };

    // -E extended BAQ, -r BAQ into BQ tag, -b BAM out
    let calmd = samtools(
        config,
        SamtoolsConfig::new(SamtoolsSubcommand::Calmd)
            .flag("-E")
            .flag("-r")
            .flag("-b")
            .positional(path_str(&artifacts.merge_bam))
            .positional(path_str(&config.reference)),
    )?
    .redirect_stdout(&artifacts.calmd_bam);

    Ok(vec![
        index(&artifacts.merge_bam, &artifacts.merge_bai, "merge_index")?,
        Stage::new("calmd", StageAction::Tool(calmd))
            .inputs(vec![artifacts.merge_bam.clone(), config.reference.clone()])
            .outputs(vec![artifacts.calmd_bam.clone()]),
        index(&artifacts.calmd_bam, &artifacts.calmd_bai, "calmd_index")?,
    ])
}


/// Plans the whole run.
///
/// # Arguments
///
/// * `config` - Resolved run configuration.
/// * `tmp_dir` - Scratch directory handed to `bfast match -T`.
///
/// # Returns
/// Stages in execution order.
pub fn build_stages(config: &RunConfig, tmp_dir: &Path) -> Result<Vec<Stage>, PipelineError> {
    let mut stages = fast_pass_stages(config)?;
    stages.push(trim_stage(config));
    stages.extend(slow_pass_stages(config, tmp_dir)?);
    stages.extend(merge_stages(config)?);
    stages.extend(finish_stages(config)?);
    Ok(stages)
}


fn validate_file_inputs(config: &RunConfig) -> Result<(), PipelineError> {
    for path in [&config.reference, &config.reads, &config.quals] {
        if !path.exists() {
            return Err(PipelineError::MissingInput { stage: "preflight".to_string(), path: path.clone() });
        }
    }
    Ok(())
}


pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let run_start = Instant::now();

    // External tools check
    if config.args.skip_tool_check || config.args.dry_run {
        info!("Skipping external tool check");
    } else {
        check_versions(vec![BOWTIE_TAG, BFAST_TAG, SAMTOOLS_TAG], &config.tools).await?;
    }

    validate_file_inputs(&config)?;
    let out_dir = config.artifacts.out_dir();

    if config.args.dry_run {
        let stages = build_stages(&config, &out_dir.join(BFAST_TMP_PREFIX))?;
        log_plan(&stages);
        return Ok(());
    }

    fs::create_dir_all(&out_dir)
        .map_err(|e| PipelineError::IOError(format!("cannot create {}: {}", out_dir.display(), e)))?;
    // Held until the run ends; dropping it deletes the directory.
    let tmp_dir = tempfile::Builder::new()
        .prefix(BFAST_TMP_PREFIX)
        .tempdir_in(&out_dir)
        .map_err(|e| PipelineError::IOError(format!("cannot create scratch dir in {}: {}", out_dir.display(), e)))?;

    let stages = build_stages(&config, tmp_dir.path())?;
    info!("Running {} stages with {} threads, output prefix {}", stages.len(), config.threads(), config.artifacts.prefix.display());

    let mut ctx = StageContext::new(TriageLedger::new(config.args.verify_triage));
    run_stages(&stages, &mut ctx).await?;

    if ctx.residual_reads == Some(0) {
        warn!("No reads left for the slow pass; merged output holds fast-pass alignments only");
    }
    info!(
        "Triage: {} reads placed by the fast pass, {} diverted, {} aligned by the slow pass after trimming",
        ctx.ledger.placed,
        ctx.ledger.diverted,
        ctx.residual_reads.unwrap_or(0)
    );
    info!("Final alignments: {}", config.artifacts.calmd_bam.display());
    info!("Pipeline finished in {} milliseconds", run_start.elapsed().as_millis());
    drop(tmp_dir);
    Ok(())
}
