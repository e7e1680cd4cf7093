//! Resource usage bookkeeping for a running sandbox

use std::sync::Mutex;

use crate::types::{ResourceUsage, Runtime};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Peak values observed while a sandbox runs. Samplers feed it, the backend
/// turns it into a [`ResourceUsage`] once the sandbox has exited.
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    peaks: Mutex<Peaks>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Peaks {
    samples: u32,
    memory_bytes: u64,
    cpu_percent: f64,
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, memory_bytes: u64, cpu_percent: Option<f64>) {
        if let Ok(mut peaks) = self.peaks.lock() {
            peaks.samples += 1;
            peaks.memory_bytes = peaks.memory_bytes.max(memory_bytes);
            if let Some(cpu) = cpu_percent.filter(|cpu| cpu.is_finite()) {
                peaks.cpu_percent = peaks.cpu_percent.max(cpu);
            }
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.peaks.lock().map(|peaks| peaks.samples).unwrap_or(0)
    }

    /// Measured peaks, or `None` when nothing was ever sampled.
    pub fn measured(&self) -> Option<ResourceUsage> {
        let peaks = self.peaks.lock().ok().map(|peaks| *peaks)?;
        if peaks.samples == 0 {
            return None;
        }
        Some(ResourceUsage::Measured {
            memory_usage_mb: round2(peaks.memory_bytes as f64 / BYTES_PER_MB),
            cpu_usage_percent: round2(peaks.cpu_percent),
        })
    }
}

/// Working-set memory: raw usage minus reclaimable page cache.
pub fn working_set_bytes(usage: u64, inactive_file: Option<u64>) -> u64 {
    usage.saturating_sub(inactive_file.unwrap_or(0))
}

/// CPU usage between two samples, as a percentage of the whole machine
/// scaled by the number of online CPUs (same formula as `docker stats`).
pub fn cpu_percent(
    total_usage: u64,
    previous_total_usage: u64,
    system_usage: u64,
    previous_system_usage: u64,
    online_cpus: u64,
) -> Option<f64> {
    let cpu_delta = total_usage.checked_sub(previous_total_usage)?;
    let system_delta = system_usage.checked_sub(previous_system_usage)?;
    if system_delta == 0 || cpu_delta == 0 {
        return Some(0.0);
    }
    let cpus = online_cpus.max(1) as f64;
    Some(cpu_delta as f64 / system_delta as f64 * cpus * 100.0)
}

/// Synthetic usage reported when the sandbox could not be observed.
///
/// Memory is the interpreter's idle footprint, capped at the limit; CPU is
/// reported as zero rather than invented.
pub fn estimate(runtime: Runtime, memory_limit_mb: u32, reason: impl Into<String>) -> ResourceUsage {
    let baseline = match runtime {
        Runtime::Javascript => 40.0,
        Runtime::Python => 12.0,
    };
    ResourceUsage::Estimated {
        memory_usage_mb: f64::min(baseline, f64::from(memory_limit_mb)),
        cpu_usage_percent: 0.0,
        reason: reason.into(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
