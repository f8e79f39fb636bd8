mod pipelines;
mod utils;
mod config;
mod cli;

use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};
use crate::cli::parse;
use crate::config::defs::RunConfig;
use crate::utils::system::{detect_cores_and_load, detect_ram};
use pipelines::triage_align;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Triage Align\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    debug!("Detected {} physical cores; CPU load {}%; tools will use {} threads", max_cores, cpu_load, args.threads);

    if let Ok((total_ram, available_ram)) = detect_ram() {
        debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
        debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
    }

    let run_config = match RunConfig::new(args, &dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    debug!("Sort memory per thread: {}", run_config.sort_memory);

    if let Err(e) = triage_align::run(run_config).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}
