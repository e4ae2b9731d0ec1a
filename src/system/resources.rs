//! CPU resources available to the engine

use std::thread;

/// Logical cores reported by the OS, 1 if unknown
pub fn available_cores() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Threads for internal engine parallelism: one core is left for the host,
/// but never fewer than two.
pub fn inference_threads() -> i32 {
    threads_for(available_cores())
}

fn threads_for(cores: usize) -> i32 {
    let threads = cores.saturating_sub(1).max(2);
    i32::try_from(threads).unwrap_or(i32::MAX)
}
