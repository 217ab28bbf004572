//! Auto-tuning module
//!
//! Detects hardware capabilities and derives load parallelism defaults.
//! Leaves most of the machine to the warehouse itself.

use sysinfo::System;

/// Tuned load values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Parallel load workers
    pub load_workers: usize,
    /// Raw events fetched per notification log round trip
    pub fetch_batch_size: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            load_workers: 2,
            fetch_batch_size: 500,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune load settings based on detected hardware
///
/// Allocation strategy:
/// - Load workers get half of the cores (min 2, max 16); object operations
///   are dominated by metadata round trips and file copies
/// - Fetch batch scales with RAM, ~250 events per GB, within [100, 5000]
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let load_workers = (cores / 2).clamp(2, 16);

    let fetch_batch_size = ((ram_mb / 1024) * 250).clamp(100, 5000) as usize;

    let config = TunedConfig {
        load_workers,
        fetch_batch_size,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::debug!(
        cores = cores,
        ram_mb = ram_mb,
        load_workers = config.load_workers,
        fetch_batch_size = config.fetch_batch_size,
        "Auto-tuned load configuration based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         Load: {} workers, fetch_batch_size={}",
        config.detected_cores,
        config.detected_ram_mb,
        config.load_workers,
        config.fetch_batch_size,
    )
}
