//! Compact one-line renderings of the metrics for logs and status lines.

use bytesize::ByteSize;

use crate::monitor::{ProcessInfo, SystemMetrics};
use crate::settings::Settings;

pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string_as(true)
}

pub fn format_rate(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Whole percent, e.g. `61%`.
pub fn format_percentage(value: f64) -> String {
    format!("{:.0}%", value)
}

/// `CPU 12% | MEM 8.0 GiB/16.0 GiB | DISK 61% | ↑1.2 KiB/s ↓5.0 MiB/s`,
/// restricted to the enabled metrics.
pub fn format_metrics(metrics: &SystemMetrics, settings: &Settings) -> String {
    let mut parts = Vec::new();

    if settings.enable_cpu {
        parts.push(format!("CPU {}", format_percentage(metrics.cpu.usage_percentage)));
    }
    if settings.enable_memory {
        parts.push(format!(
            "MEM {}/{}",
            format_bytes(metrics.memory.used_bytes),
            format_bytes(metrics.memory.total_bytes)
        ));
    }
    if settings.enable_disk {
        parts.push(format!("DISK {}", format_percentage(metrics.disk.usage_percentage())));
    }
    if settings.enable_network {
        parts.push(format!(
            "↑{} ↓{}",
            format_rate(metrics.network.upload_bytes_per_second),
            format_rate(metrics.network.download_bytes_per_second)
        ));
    }

    parts.join(" | ")
}

pub fn format_process(process: &ProcessInfo) -> String {
    format!(
        "{:>7} {:<24} {:>5.1}% {:>10}",
        process.id,
        process.name,
        process.cpu_usage,
        format_bytes(process.memory_usage)
    )
}
