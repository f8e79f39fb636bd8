/// Functions and structs for working with creating command-line arguments

use std::path::PathBuf;
use anyhow::{anyhow, Result};
use log::{info, warn};
use crate::config::defs::{PipelineError, RunConfig, ToolPaths, BFAST_TAG, BOWTIE_TAG, SAMTOOLS_TAG, TOOL_VERSIONS};


/// A fully resolved external command: program, arguments, and where its stdout goes.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn redirect_stdout(mut self, path: &PathBuf) -> Self {
        self.stdout = Some(path.clone());
        self
    }

    /// Shell-like rendering for logs and dry runs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(out) = &self.stdout {
            line.push_str(" > ");
            line.push_str(&out.display().to_string());
        }
        line
    }
}


/// Per-tool argument builders implement this to plug into `generate_cli`.
pub trait ArgGenerator {
    fn tool(&self) -> &'static str;
    fn generate_args(&self, config: &RunConfig) -> Result<Vec<String>>;
}


fn path_arg(path: &PathBuf) -> String {
    path.to_string_lossy().to_string()
}


pub mod bowtie {
    use std::path::PathBuf;
    use anyhow::Result;
    use crate::config::defs::{RunConfig, BOWTIE_TAG};
    use super::{path_arg, ArgGenerator};

    /// Fast colour-space pass: one alignment per read, multi-placed reads diverted.
    #[derive(Debug, Clone)]
    pub struct BowtieConfig {
        pub index: PathBuf,
        pub reads: PathBuf,
        pub quals: PathBuf,
        pub unaligned: PathBuf,
    }

    impl ArgGenerator for BowtieConfig {
        fn tool(&self) -> &'static str {
            BOWTIE_TAG
        }

        fn generate_args(&self, config: &RunConfig) -> Result<Vec<String>> {
            let mut args_vec: Vec<String> = Vec::new();
            args_vec.push("-C".to_string()); // colour space
            args_vec.push("-S".to_string()); // SAM out
            args_vec.push("-f".to_string()); // csfasta in
            args_vec.push("-p".to_string());
            args_vec.push(config.threads().to_string());
            args_vec.push("--seed".to_string());
            args_vec.push(config.args.seed.to_string());
            args_vec.push("-v".to_string());
            args_vec.push(config.args.max_mismatches.to_string());
            // -k 1 -m 1: report one hit, suppress reads with more than one
            args_vec.push("-k".to_string());
            args_vec.push("1".to_string());
            args_vec.push("-m".to_string());
            args_vec.push("1".to_string());
            args_vec.push("--best".to_string());
            args_vec.push("--strata".to_string());
            args_vec.push("--un".to_string());
            args_vec.push(path_arg(&self.unaligned));
            args_vec.push("-Q".to_string());
            args_vec.push(path_arg(&self.quals));
            args_vec.push(path_arg(&self.index));
            args_vec.push(path_arg(&self.reads));
            Ok(args_vec)
        }
    }
}


pub mod bfast {
    use std::path::PathBuf;
    use anyhow::Result;
    use crate::config::defs::{BfastSubcommand, RunConfig, BFAST_COLOR_SPACE, BFAST_SAM_OUTPUT, BFAST_TAG};
    use super::{path_arg, ArgGenerator};

    #[derive(Debug, Clone)]
    pub struct BfastConfig {
        pub subcommand: BfastSubcommand,
        /// Reads for `match`, matches for `localalign`, alignments for `postprocess`.
        pub input: PathBuf,
        /// Scratch directory for `match`.
        pub tmp_dir: Option<PathBuf>,
    }

    impl ArgGenerator for BfastConfig {
        fn tool(&self) -> &'static str {
            BFAST_TAG
        }

        fn generate_args(&self, config: &RunConfig) -> Result<Vec<String>> {
            let mut args_vec: Vec<String> = vec![self.subcommand.as_str().to_string()];
            args_vec.push("-f".to_string());
            args_vec.push(path_arg(&config.reference));
            args_vec.push("-A".to_string());
            args_vec.push(BFAST_COLOR_SPACE.to_string());

            match self.subcommand {
                BfastSubcommand::Match => {
                    args_vec.push("-r".to_string());
                    args_vec.push(path_arg(&self.input));
                    args_vec.push("-M".to_string());
                    args_vec.push(config.args.max_candidates.to_string());
                    if let Some(tmp) = &self.tmp_dir {
                        // bfast concatenates file names onto -T, so it needs the separator
                        let mut tmp = path_arg(tmp);
                        if !tmp.ends_with('/') {
                            tmp.push('/');
                        }
                        args_vec.push("-T".to_string());
                        args_vec.push(tmp);
                    }
                }
                BfastSubcommand::LocalAlign => {
                    args_vec.push("-m".to_string());
                    args_vec.push(path_arg(&self.input));
                }
                BfastSubcommand::PostProcess => {
                    args_vec.push("-i".to_string());
                    args_vec.push(path_arg(&self.input));
                    args_vec.push("-a".to_string());
                    args_vec.push(config.policy.mode().to_string());
                    args_vec.push("-q".to_string());
                    args_vec.push(config.args.min_mapq.to_string());
                    args_vec.push("-O".to_string());
                    args_vec.push(BFAST_SAM_OUTPUT.to_string());
                }
            }

            args_vec.push("-n".to_string());
            args_vec.push(config.threads().to_string());
            Ok(args_vec)
        }
    }
}


pub mod samtools {
    use anyhow::{anyhow, Result};
    use crate::config::defs::{RunConfig, SamtoolsSubcommand, SAMTOOLS_TAG};
    use super::ArgGenerator;

    /// Ordered `(flag, value)` options followed by positional arguments.
    #[derive(Debug, Clone)]
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub subcommand_fields: Vec<(String, Option<String>)>,
        pub positionals: Vec<String>,
    }

    impl SamtoolsConfig {
        pub fn new(subcommand: SamtoolsSubcommand) -> Self {
            SamtoolsConfig { subcommand, subcommand_fields: Vec::new(), positionals: Vec::new() }
        }

        pub fn flag(mut self, flag: &str) -> Self {
            self.subcommand_fields.push((flag.to_string(), None));
            self
        }

        pub fn option(mut self, flag: &str, value: impl Into<String>) -> Self {
            self.subcommand_fields.push((flag.to_string(), Some(value.into())));
            self
        }

        pub fn positional(mut self, value: impl Into<String>) -> Self {
            self.positionals.push(value.into());
            self
        }
    }

    impl ArgGenerator for SamtoolsConfig {
        fn tool(&self) -> &'static str {
            SAMTOOLS_TAG
        }

        fn generate_args(&self, config: &RunConfig) -> Result<Vec<String>> {
            let mut args_vec: Vec<String> = vec![self.subcommand.as_str().to_string()];

            match self.subcommand {
                SamtoolsSubcommand::View | SamtoolsSubcommand::Sort | SamtoolsSubcommand::Merge => {
                    args_vec.push("-@".to_string());
                    args_vec.push(config.threads().to_string());
                }
                SamtoolsSubcommand::Index | SamtoolsSubcommand::Calmd => {}
            }

            for (flag, value) in &self.subcommand_fields {
                args_vec.push(flag.clone());
                if let Some(value) = value {
                    args_vec.push(value.clone());
                }
            }

            if self.positionals.is_empty() {
                return Err(anyhow!("samtools {} needs at least one input", self.subcommand.as_str()));
            }
            args_vec.extend(self.positionals.iter().cloned());
            Ok(args_vec)
        }
    }
}


/// Builds the invocation for a configured tool.
///
/// # Arguments
///
/// * `config` - RunConfig, supplies thread counts, reference and tool binaries.
/// * `tool_config` - Tool-specific argument builder.
///
/// # Returns
/// ToolInvocation with stdout not yet redirected.
pub fn generate_cli(config: &RunConfig, tool_config: &dyn ArgGenerator) -> Result<ToolInvocation, PipelineError> {
    let tool = tool_config.tool();
    let args = tool_config
        .generate_args(config)
        .map_err(|e| PipelineError::ToolExecution { tool: tool.to_string(), error: e.to_string() })?;
    Ok(ToolInvocation {
        tool: tool.to_string(),
        program: config.tools.for_tool(tool),
        args,
        stdout: None,
    })
}


mod presence {
    use std::path::Path;
    use std::process::Stdio;
    use anyhow::{anyhow, Result};
    use tokio::process::Command;

    /// Runs `program version_args`, returning stdout and stderr lines together.
    /// Exit status is ignored: bfast prints its banner and exits non-zero.
    pub async fn banner(program: &Path, version_args: &[&str]) -> Result<Vec<String>> {
        let output = Command::new(program)
            .args(version_args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", program.display(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(stdout.lines().chain(stderr.lines()).map(|l| l.to_string()).collect())
    }
}


/// Extracts a version string from a tool's banner.
///
/// bowtie: "<path>/bowtie-align-s version 1.3.1" (also "bowtie version 1.0.0");
/// samtools: "samtools 1.20"; bfast: a "Version: 0.7.0a" line in its usage text.
pub fn parse_version(tool: &str, lines: &[String]) -> Result<String> {
    let version = match tool {
        BOWTIE_TAG => lines
            .iter()
            .find(|l| l.contains(" version "))
            .and_then(|l| l.split_whitespace().last()),
        SAMTOOLS_TAG => lines
            .iter()
            .find(|l| l.starts_with("samtools "))
            .and_then(|l| l.split_whitespace().nth(1)),
        BFAST_TAG => lines
            .iter()
            .find_map(|l| l.trim().strip_prefix("Version:"))
            .and_then(|v| v.split_whitespace().next()),
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    version
        .map(|v| v.to_string())
        .ok_or_else(|| anyhow!("No version found in {} output", tool))
}


/// Leading (major, minor) of a version string, e.g. "1.3.1" -> (1, 3), "0.7.0a" -> (0, 7).
pub fn version_number(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next().unwrap_or("0").chars().take_while(|c| c.is_ascii_digit()).collect();
    let minor = if minor.is_empty() { 0 } else { minor.parse().ok()? };
    Some((major, minor))
}


pub async fn check_version(tool: &str, tools: &ToolPaths) -> Result<String> {
    let program = tools.for_tool(tool);
    let version_args: &[&str] = match tool {
        BOWTIE_TAG => &["--version"],
        SAMTOOLS_TAG => &["--version"],
        BFAST_TAG => &[],
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    let lines = presence::banner(&program, version_args).await?;
    parse_version(tool, &lines)
}


/// Confirms every tool can be launched, warning when a version is older than expected.
pub async fn check_versions(tools_to_check: Vec<&str>, tools: &ToolPaths) -> Result<(), PipelineError> {
    for tool in tools_to_check {
        let version = check_version(tool, tools)
            .await
            .map_err(|e| PipelineError::ToolNotFound { tool: tool.to_string(), error: e.to_string() })?;
        match (version_number(&version), TOOL_VERSIONS.get(tool)) {
            (Some(found), Some(&minimum)) if found < minimum => {
                warn!("{} version {} is older than the tested minimum {}.{}", tool, version, minimum.0, minimum.1);
            }
            (None, _) => warn!("Could not interpret {} version '{}'", tool, version),
            _ => info!("{} version {}", tool, version),
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use clap::Parser;
    use crate::cli::Arguments;
    use crate::config::defs::{BfastSubcommand, SamtoolsSubcommand};
    use super::bfast::BfastConfig;
    use super::bowtie::BowtieConfig;
    use super::samtools::SamtoolsConfig;

    fn config(extra: &[&str]) -> RunConfig {
        let mut argv = vec!["triage-align", "-r", "/ref/hg.fa", "-o", "/out/s", "-t", "4", "--sort-memory", "1G"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["/in/r.csfasta", "/in/r.qual"]);
        RunConfig::new(Arguments::try_parse_from(argv).unwrap(), Path::new("/")).unwrap()
    }

    #[test]
    fn test_bowtie_args() {
        let config = config(&["--seed", "7"]);
        let bowtie = BowtieConfig {
            index: config.bowtie_index.clone(),
            reads: config.reads.clone(),
            quals: config.quals.clone(),
            unaligned: config.artifacts.bowtie_un.clone(),
        };
        let invocation = generate_cli(&config, &bowtie).unwrap();
        assert_eq!(invocation.program, PathBuf::from("bowtie"));
        assert_eq!(
            invocation.command_line(),
            "bowtie -C -S -f -p 4 --seed 7 -v 2 -k 1 -m 1 --best --strata --un /out/s.bowtie.un -Q /in/r.qual /ref/hg /in/r.csfasta"
        );
    }

    #[test]
    fn test_bfast_args_per_subcommand() {
        let config = config(&["-m", "2"]);
        let matching = BfastConfig {
            subcommand: BfastSubcommand::Match,
            input: PathBuf::from("/out/s.bfastq"),
            tmp_dir: Some(PathBuf::from("/out/tmp")),
        };
        assert_eq!(
            matching.generate_args(&config).unwrap().join(" "),
            "match -f /ref/hg.fa -A 1 -r /out/s.bfastq -M 384 -T /out/tmp/ -n 4"
        );

        let local = BfastConfig { subcommand: BfastSubcommand::LocalAlign, input: PathBuf::from("/out/s.bmf"), tmp_dir: None };
        assert_eq!(local.generate_args(&config).unwrap().join(" "), "localalign -f /ref/hg.fa -A 1 -m /out/s.bmf -n 4");

        let post = BfastConfig { subcommand: BfastSubcommand::PostProcess, input: PathBuf::from("/out/s.baf"), tmp_dir: None };
        assert_eq!(
            post.generate_args(&config).unwrap().join(" "),
            "postprocess -f /ref/hg.fa -A 1 -i /out/s.baf -a 2 -q 10 -O 1 -n 4"
        );
    }

    #[test]
    fn test_samtools_args() {
        let config = config(&[]);
        let sort = SamtoolsConfig::new(SamtoolsSubcommand::Sort)
            .option("-m", "1G")
            .option("-o", "/out/s.bowtie.bam")
            .positional("/out/s.bowtie.unsorted.bam");
        assert_eq!(
            sort.generate_args(&config).unwrap().join(" "),
            "sort -@ 4 -m 1G -o /out/s.bowtie.bam /out/s.bowtie.unsorted.bam"
        );

        let calmd = SamtoolsConfig::new(SamtoolsSubcommand::Calmd)
            .flag("-E")
            .flag("-r")
            .flag("-b")
            .positional("/out/s.merge.bam")
            .positional("/ref/hg.fa");
        assert_eq!(calmd.generate_args(&config).unwrap().join(" "), "calmd -E -r -b /out/s.merge.bam /ref/hg.fa");

        assert!(SamtoolsConfig::new(SamtoolsSubcommand::Index).generate_args(&config).is_err());
    }

    #[test]
    fn test_parse_version() {
        let bowtie = vec!["/usr/bin/bowtie-align-s version 1.3.1".to_string(), "64-bit".to_string()];
        assert_eq!(parse_version(BOWTIE_TAG, &bowtie).unwrap(), "1.3.1");

        let samtools = vec!["samtools 1.20".to_string(), "Using htslib 1.20".to_string()];
        assert_eq!(parse_version(SAMTOOLS_TAG, &samtools).unwrap(), "1.20");

        let bfast = vec!["".to_string(), "Program: bfast".to_string(), "Version: 0.7.0a".to_string()];
        assert_eq!(parse_version(BFAST_TAG, &bfast).unwrap(), "0.7.0a");

        assert!(parse_version(SAMTOOLS_TAG, &["garbage".to_string()]).is_err());
    }

    #[test]
    fn test_version_number() {
        assert_eq!(version_number("1.3.1"), Some((1, 3)));
        assert_eq!(version_number("0.7.0a"), Some((0, 7)));
        assert_eq!(version_number("2"), Some((2, 0)));
        assert_eq!(version_number("abc"), None);
        // 1.9 predates 1.10
        assert!(version_number("1.9") < version_number("1.10"));
    }

    #[tokio::test]
    async fn test_check_version_missing_tool() {
        let tools = ToolPaths {
            samtools: PathBuf::from("/nonexistent/samtools"),
            ..ToolPaths::default()
        };
        let result = check_versions(vec![SAMTOOLS_TAG], &tools).await;
        assert!(matches!(result, Err(PipelineError::ToolNotFound { .. })));
    }
}
