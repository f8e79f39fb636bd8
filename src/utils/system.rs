// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::time::sleep;
use anyhow::{anyhow, Result};

const MIB: u64 = 1_048_576;
const MIN_SORT_MEMORY_MB: u64 = 128;
const MAX_SORT_MEMORY_MB: u64 = 4096;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Arguments
///
/// * `args_threads` - Thread count requested on the command line.
///
/// # Returns
///
/// Result<(usize, f32)> physical cores, current cpu usage
pub async fn detect_cores_and_load(args_threads: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    if args_threads > physical_cores {
        log::warn!("Requested {} threads but only {} physical cores detected", args_threads, physical_cores);
    }
    Ok((physical_cores, cpu_load))
}


/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram in bytes
pub fn detect_ram() -> Result<(u64, u64)> {
    let (total_ram, available_ram) = if cfg!(target_os = "macos") {
        let refresh_kind = RefreshKind::nothing().with_memory(Default::default());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        let total = system.total_memory();
        let used = system.used_memory();
        (total, total.saturating_sub(used))
    } else {
        let refresh_kind = RefreshKind::nothing().with_memory(Default::default());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}


/// Per-thread memory for `samtools sort -m`.
///
/// Half of the available RAM split across the sort threads, clamped to [128M, 4096M].
///
/// # Arguments
///
/// * `available_ram` - Usable RAM in bytes.
/// * `threads` - Sort threads (`-@`).
///
/// # Returns
/// String such as "768M"
pub fn compute_sort_memory(available_ram: u64, threads: usize) -> String {
    let per_thread_mb = (available_ram / 2) / threads.max(1) as u64 / MIB;
    let clamped = per_thread_mb.clamp(MIN_SORT_MEMORY_MB, MAX_SORT_MEMORY_MB);
    format!("{}M", clamped)
}
