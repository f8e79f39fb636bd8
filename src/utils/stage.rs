//! Declarative pipeline stages and their sequential executor.
//!
//! Each stage declares the files it reads and writes. The executor checks
//! inputs before and outputs after every stage and stops at the first error,
//! leaving whatever was produced so far on disk.

use std::path::PathBuf;
use anyhow::anyhow;
use futures::future::OptionFuture;
use log::{debug, info};
use crate::config::defs::{PipelineError, TrimConfig, LINE_CHANNEL_BUFFER};
use crate::utils::command::ToolInvocation;
use crate::utils::file::remove_files;
use crate::utils::rescore::{spawn_rescore_filter, RescoreStats};
use crate::utils::streams::{parse_child_output, spawn_tool, stream_to_cmd, ExitReport};
use crate::utils::trim::{trim_reads, TrimStats};
use crate::utils::triage::TriageLedger;


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunCondition {
    Always,
    /// Trimming left reads for the slow pass (or has not run yet).
    ResidualReads,
    NoResidualReads,
}

impl RunCondition {
    pub fn holds(&self, residual_reads: Option<u64>) -> bool {
        match self {
            RunCondition::Always => true,
            RunCondition::ResidualReads => residual_reads != Some(0),
            RunCondition::NoResidualReads => residual_reads == Some(0),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunCondition::Always => "always",
            RunCondition::ResidualReads => "if residual reads",
            RunCondition::NoResidualReads => "if no residual reads",
        }
    }
}


/// What happens to each line between producer and consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineTransform {
    Passthrough,
    RescoreMapq,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrimJob {
    pub reads: PathBuf,
    pub quals: Option<PathBuf>,
    pub output: PathBuf,
    pub config: TrimConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    Tool(ToolInvocation),
    Stream {
        producer: ToolInvocation,
        transform: LineTransform,
        consumer: ToolInvocation,
    },
    Trim(TrimJob),
    Remove(Vec<PathBuf>),
}

impl StageAction {
    pub fn describe(&self) -> String {
        match self {
            StageAction::Tool(invocation) => invocation.command_line(),
            StageAction::Stream { producer, transform, consumer } => match transform {
                LineTransform::Passthrough => format!("{} | {}", producer.command_line(), consumer.command_line()),
                LineTransform::RescoreMapq => {
                    format!("{} | <rescore MAPQ> | {}", producer.command_line(), consumer.command_line())
                }
            },
            StageAction::Trim(job) => format!(
                "<trim window={} mean>={} min-quality={} min-length={}> {} -> {}",
                job.config.window,
                job.config.window_quality,
                job.config.min_quality,
                job.config.min_length,
                job.reads.display(),
                job.output.display()
            ),
            StageAction::Remove(paths) => {
                let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                format!("rm -f {}", names.join(" "))
            }
        }
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub condition: RunCondition,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub action: StageAction,
}

impl Stage {
    pub fn new(name: &str, action: StageAction) -> Self {
        Stage {
            name: name.to_string(),
            condition: RunCondition::Always,
            inputs: Vec::new(),
            outputs: Vec::new(),
            action,
        }
    }

    pub fn inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn when(mut self, condition: RunCondition) -> Self {
        self.condition = condition;
        self
    }
}


/// State threaded through a run.
#[derive(Debug, Default)]
pub struct StageContext {
    pub ledger: TriageLedger,
    pub rescore: Option<RescoreStats>,
    pub trim: Option<TrimStats>,
    pub residual_reads: Option<u64>,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
}

impl StageContext {
    pub fn new(ledger: TriageLedger) -> Self {
        StageContext { ledger, ..Default::default() }
    }
}


/// One line per stage, as logged for `--dry-run`.
pub fn plan_lines(stages: &[Stage]) -> Vec<String> {
    stages
        .iter()
        .enumerate()
        .map(|(i, stage)| format!("[{}] {} ({}): {}", i + 1, stage.name, stage.condition.label(), stage.action.describe()))
        .collect()
}

pub fn log_plan(stages: &[Stage]) {
    info!("Dry run: {} stages planned", stages.len());
    for line in plan_lines(stages) {
        info!("{}", line);
    }
}


/// Runs stages in order, stopping at the first failure.
///
/// # Arguments
///
/// * `stages` - Planned stages.
/// * `ctx` - Run state; receives statistics and the residual read count.
///
/// # Returns
/// Ok after the last stage, or the first stage error.
pub async fn run_stages(stages: &[Stage], ctx: &mut StageContext) -> Result<(), PipelineError> {
    for stage in stages {
        if !stage.condition.holds(ctx.residual_reads) {
            info!("Skipping stage {} ({})", stage.name, stage.condition.label());
            ctx.skipped.push(stage.name.clone());
            continue;
        }

        for input in &stage.inputs {
            if !input.exists() {
                return Err(PipelineError::MissingInput { stage: stage.name.clone(), path: input.clone() });
            }
        }

        info!("Running stage {}", stage.name);
        debug!("{}", stage.action.describe());
        run_action(&stage.action, ctx).await?;

        for output in &stage.outputs {
            if !output.exists() {
                return Err(PipelineError::MissingOutput { stage: stage.name.clone(), path: output.clone() });
            }
        }
        ctx.completed.push(stage.name.clone());
    }
    Ok(())
}


async fn run_action(action: &StageAction, ctx: &mut StageContext) -> Result<(), PipelineError> {
    match action {
        StageAction::Tool(invocation) => spawn_tool(invocation, false, false)?.wait().await?.into_result(),
        StageAction::Stream { producer, transform, consumer } => run_stream(producer, *transform, consumer, ctx).await,
        StageAction::Trim(job) => run_trim(job, ctx).await,
        StageAction::Remove(paths) => {
            let removed = remove_files(paths)?;
            debug!("Removed {} of {} intermediate files", removed, paths.len());
            Ok(())
        }
    }
}


/// Producer stdout -> transform -> consumer stdin, all running concurrently.
///
/// Failures are reported in order of cause: producer exit code, transform
/// error, consumer failure, producer killed by a signal, then pipe errors.
async fn run_stream(
    producer: &ToolInvocation,
    transform: LineTransform,
    consumer: &ToolInvocation,
    ctx: &mut StageContext,
) -> Result<(), PipelineError> {
    let mut producer_proc = spawn_tool(producer, false, true)?;
    let mut consumer_proc = match spawn_tool(consumer, true, false) {
        Ok(proc) => proc,
        Err(e) => {
            let _ = producer_proc.child.start_kill();
            let _ = producer_proc.wait().await;
            return Err(e);
        }
    };

    let (rx, reader_task) = parse_child_output(&mut producer_proc.child, LINE_CHANNEL_BUFFER)?;
    let (rx, rescore_task) = match transform {
        LineTransform::Passthrough => (rx, None),
        LineTransform::RescoreMapq => {
            let ledger = std::mem::take(&mut ctx.ledger);
            let (out_rx, task) = spawn_rescore_filter(rx, LINE_CHANNEL_BUFFER, ledger);
            (out_rx, Some(task))
        }
    };
    let consumer_tool = consumer_proc.tool.clone();
    let writer_task = stream_to_cmd(rx, &mut consumer_proc.child, &consumer_tool)?;

    let rescore_fut: OptionFuture<_> = rescore_task.into();
    let (producer_report, consumer_report, reader_result, rescore_result, writer_result) = tokio::join!(
        producer_proc.wait(),
        consumer_proc.wait(),
        reader_task,
        rescore_fut,
        writer_task
    );

    let producer_report: ExitReport = producer_report?;
    let consumer_report: ExitReport = consumer_report?;

    if producer_report.failed_with_code() {
        return producer_report.into_result();
    }
    if let Some(result) = rescore_result {
        let filter = result.map_err(|e| PipelineError::Other(anyhow!("rescore task failed: {}", e)))??;
        filter.stats.log_summary();
        info!(
            "Triage: {} reads placed by the fast pass, {} unplaced records",
            filter.ledger.placed, filter.ledger.unplaced_records
        );
        ctx.ledger = filter.ledger;
        ctx.rescore = Some(filter.stats);
    }
    if !consumer_report.status.success() {
        return consumer_report.into_result();
    }
    producer_report.into_result()?;

    reader_result
        .map_err(|e| PipelineError::Other(anyhow!("reader task failed: {}", e)))?
        .map_err(PipelineError::Other)?;
    writer_result.map_err(|e| PipelineError::Other(anyhow!("writer task failed: {}", e)))??;
    Ok(())
}


async fn run_trim(job: &TrimJob, ctx: &mut StageContext) -> Result<(), PipelineError> {
    let job = job.clone();
    let mut ledger = std::mem::take(&mut ctx.ledger);
    let (result, ledger) = tokio::task::spawn_blocking(move || {
        let result = trim_reads(&job.reads, job.quals.as_deref(), &job.output, &job.config, &mut ledger);
        (result, ledger)
    })
    .await
    .map_err(|e| PipelineError::Other(anyhow!("trimming task failed: {}", e)))?;
    ctx.ledger = ledger;

    let stats = result?;
    stats.log_summary();
    ctx.residual_reads = Some(stats.kept);
    ctx.trim = Some(stats);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn sh(tool: &str, script: &str) -> ToolInvocation {
        ToolInvocation {
            tool: tool.to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            stdout: None,
        }
    }

    fn cat_into(path: &Path) -> ToolInvocation {
        sh("sink", "cat").redirect_stdout(&path.to_path_buf())
    }

    const SAM: &str = "@HD\\tVN:1.0\\nr1\\t0\\tchr1\\t5\\t30\\t4M\\t*\\t0\\t0\\tACGT\\tIIII\\tNM:i:1\\tXA:i:1\\nr2\\t4\\t*\\t0\\t0\\t*\\t*\\t0\\t0\\tACGT\\tIIII\\n";

    #[test]
    fn test_conditions() {
        assert!(RunCondition::Always.holds(Some(0)));
        assert!(RunCondition::ResidualReads.holds(None));
        assert!(RunCondition::ResidualReads.holds(Some(3)));
        assert!(!RunCondition::ResidualReads.holds(Some(0)));
        assert!(RunCondition::NoResidualReads.holds(Some(0)));
        assert!(!RunCondition::NoResidualReads.holds(None));
    }

    #[tokio::test]
    async fn test_tool_stage_and_output_check() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("out.txt");
        let stages = vec![
            Stage::new("write", StageAction::Tool(sh("sh", "echo hello").redirect_stdout(&out))).outputs(vec![out.clone()]),
        ];
        let mut ctx = StageContext::default();
        run_stages(&stages, &mut ctx).await?;
        assert_eq!(std::fs::read_to_string(&out)?, "hello\n");
        assert_eq!(ctx.completed, vec!["write".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_input_stops_before_running() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let marker = dir.path().join("ran");
        let stages = vec![
            Stage::new("needs", StageAction::Tool(sh("sh", &format!("touch {}", marker.display()))))
                .inputs(vec![dir.path().join("absent")]),
        ];
        let result = run_stages(&stages, &mut StageContext::default()).await;
        assert!(matches!(result, Err(PipelineError::MissingInput { .. })));
        assert!(!marker.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_output_fails() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let stages = vec![Stage::new("noop", StageAction::Tool(sh("sh", "true"))).outputs(vec![dir.path().join("never")])];
        let result = run_stages(&stages, &mut StageContext::default()).await;
        assert!(matches!(result, Err(PipelineError::MissingOutput { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_fast() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let marker = dir.path().join("second");
        let stages = vec![
            Stage::new("first", StageAction::Tool(sh("first", "exit 2"))),
            Stage::new("second", StageAction::Tool(sh("sh", &format!("touch {}", marker.display())))),
        ];
        let mut ctx = StageContext::default();
        match run_stages(&stages, &mut ctx).await {
            Err(PipelineError::ToolFailed { tool, .. }) => assert_eq!(tool, "first"),
            other => panic!("expected ToolFailed, got {:?}", other),
        }
        assert!(!marker.exists());
        assert!(ctx.completed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_conditional_skip() -> anyhow::Result<()> {
        let stages = vec![
            Stage::new("slow", StageAction::Tool(sh("sh", "exit 1"))).when(RunCondition::ResidualReads),
            Stage::new("fallback", StageAction::Tool(sh("sh", "true"))).when(RunCondition::NoResidualReads),
        ];
        let mut ctx = StageContext { residual_reads: Some(0), ..Default::default() };
        run_stages(&stages, &mut ctx).await?;
        assert_eq!(ctx.skipped, vec!["slow".to_string()]);
        assert_eq!(ctx.completed, vec!["fallback".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_passthrough_stream() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("copy");
        let stages = vec![Stage::new(
            "copy",
            StageAction::Stream {
                producer: sh("source", "printf 'a\\nb\\n'"),
                transform: LineTransform::Passthrough,
                consumer: cat_into(&out),
            },
        )];
        run_stages(&stages, &mut StageContext::default()).await?;
        assert_eq!(std::fs::read_to_string(&out)?, "a\nb\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_rescore_stream() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("rescored.sam");
        let stages = vec![Stage::new(
            "fast",
            StageAction::Stream {
                producer: sh("source", &format!("printf '{}'", SAM)),
                transform: LineTransform::RescoreMapq,
                consumer: cat_into(&out),
            },
        )];
        let mut ctx = StageContext::new(TriageLedger::new(true));
        run_stages(&stages, &mut ctx).await?;

        let text = std::fs::read_to_string(&out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "@HD\tVN:1.0");
        assert_eq!(lines[1].split('\t').nth(4), Some("18"));
        let stats = ctx.rescore.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.unmapped, 1);
        assert_eq!(ctx.ledger.placed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_producer_failure() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let stages = vec![Stage::new(
            "fast",
            StageAction::Stream {
                producer: sh("bowtie", "echo 'could not locate index' >&2; exit 1"),
                transform: LineTransform::RescoreMapq,
                consumer: cat_into(&dir.path().join("out")),
            },
        )];
        match run_stages(&stages, &mut StageContext::default()).await {
            Err(PipelineError::ToolFailed { tool, stderr_tail, .. }) => {
                assert_eq!(tool, "bowtie");
                assert_eq!(stderr_tail, vec!["could not locate index".to_string()]);
            }
            other => panic!("expected ToolFailed, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_consumer_failure() -> anyhow::Result<()> {
        let stages = vec![Stage::new(
            "fast",
            StageAction::Stream {
                producer: sh("source", "printf 'a\\n'"),
                transform: LineTransform::Passthrough,
                consumer: sh("samtools", "exit 4"),
            },
        )];
        match run_stages(&stages, &mut StageContext::default()).await {
            Err(PipelineError::ToolFailed { tool, .. }) => assert_eq!(tool, "samtools"),
            other => panic!("expected ToolFailed, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_malformed_record() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let stages = vec![Stage::new(
            "fast",
            StageAction::Stream {
                producer: sh("source", "printf 'r1\\t0\\tchr1\\n'"),
                transform: LineTransform::RescoreMapq,
                consumer: cat_into(&dir.path().join("out")),
            },
        )];
        let result = run_stages(&stages, &mut StageContext::default()).await;
        assert!(matches!(result, Err(PipelineError::InvalidSamRecord { line: 1, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_trim_and_remove_stages() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let un = dir.path().join("x.bowtie.un");
        let fq = dir.path().join("x.bfastq");
        std::fs::write(&un, "@r1\nT0123\n+\n????\n")?;
        let config = TrimConfig { window: 2, window_quality: 20.0, min_quality: 10, min_length: 2 };
        let stages = vec![
            Stage::new("trim", StageAction::Trim(TrimJob { reads: un.clone(), quals: None, output: fq.clone(), config }))
                .outputs(vec![fq.clone()]),
            Stage::new("cleanup", StageAction::Remove(vec![un.clone()])),
        ];
        let mut ctx = StageContext::default();
        run_stages(&stages, &mut ctx).await?;
        assert_eq!(ctx.residual_reads, Some(1));
        assert_eq!(ctx.trim.as_ref().map(|t| t.kept), Some(1));
        assert!(!un.exists());
        Ok(())
    }

    #[test]
    fn test_plan_lines() {
        let stages = vec![
            Stage::new("index", StageAction::Tool(sh("sh", "true"))),
            Stage::new("cleanup", StageAction::Remove(vec![PathBuf::from("a.bmf"), PathBuf::from("a.baf")]))
                .when(RunCondition::ResidualReads),
        ];
        let lines = plan_lines(&stages);
        assert_eq!(lines[0], "[1] index (always): sh -c true");
        assert_eq!(lines[1], "[2] cleanup (if residual reads): rm -f a.bmf a.baf");
    }
}
