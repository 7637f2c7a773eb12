mod cpu;
mod disk;
mod disk_health;
mod memory;
mod network;
mod process;
mod rate;
mod system;
mod volumes;

use std::path::PathBuf;
use std::time::Instant;

pub use cpu::{CpuMonitor, CpuTicks, TickSource};
pub use disk::{DiskMonitor, IoCounterSource, IoCounters, VolumeInfo};
pub use disk_health::{
    determine_status, Attribute, DiskHealthInfo, DiskHealthMonitor, HealthStatus, SmartProvider,
    SmartReport,
};
pub use memory::{MemoryMonitor, PageSource, VmPageStats};
pub use network::{InterfaceCounters, InterfaceSource, NetworkMonitor};
pub use process::{ProcessInfo, ProcessMonitor, ProcessSort, ProcessTable, LOW_PID_THRESHOLD};
pub use rate::{RateSample, RateTracker};
pub use system::{network_indicator, Collectors, SharedCollector, SystemMonitor};
pub use volumes::{
    MountWatcher, MountedVolume, SysinfoVolumes, VolumeEvent, VolumeEvents, VolumeTable,
};

use crate::error::Result;
use crate::settings::Settings;

/// Placeholder shown when a volume reports no name.
pub const UNTITLED_VOLUME: &str = "Untitled";

/// A monitor that produces one metric value per poll cycle.
///
/// Implementations run on a blocking worker, so they may call into the
/// kernel directly. `Send` lets the coordinator move them across workers.
pub trait Collector: Send {
    type Output: Send + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn collect(&mut self) -> Result<Self::Output>;

    /// Pick up changed settings before the next cycle.
    fn configure(&mut self, _settings: &Settings) {}
}

/// Clamp a percentage into `[0, 100]`, mapping NaN to 0.
pub fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuMetrics {
    pub usage_percentage: f64,
    pub system_usage: f64,
    pub user_usage: f64,
    pub idle_percentage: f64,
}

impl CpuMetrics {
    /// Build from user/system/idle shares. Usage is always `user + system`.
    pub fn new(user_usage: f64, system_usage: f64, idle_percentage: f64) -> Self {
        let user_usage = clamp_percentage(user_usage);
        let system_usage = clamp_percentage(system_usage);
        Self {
            usage_percentage: user_usage + system_usage,
            system_usage,
            user_usage,
            idle_percentage: clamp_percentage(idle_percentage),
        }
    }

    /// 0% usage, 100% idle.
    pub fn idle() -> Self {
        Self::new(0.0, 0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub cached_bytes: u64,
}

impl MemoryMetrics {
    pub fn new(total_bytes: u64, used_bytes: u64, free_bytes: u64, cached_bytes: u64) -> Self {
        Self {
            total_bytes: total_bytes.max(1),
            used_bytes,
            free_bytes,
            cached_bytes,
        }
    }

    pub fn usage_percentage(&self) -> f64 {
        clamp_percentage(self.used_bytes as f64 / self.total_bytes.max(1) as f64 * 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMetrics {
    pub volume_path: String,
    pub volume_name: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub read_bytes_per_second: u64,
    pub write_bytes_per_second: u64,
}

impl DiskMetrics {
    /// Normalizes the path to start with `/` and the name to a placeholder
    /// when empty.
    pub fn new(volume_path: &str, volume_name: &str, total_bytes: u64, free_bytes: u64) -> Self {
        let volume_path = if volume_path.starts_with('/') {
            volume_path.to_string()
        } else {
            format!("/{volume_path}")
        };
        let volume_name = match volume_name.trim() {
            "" => UNTITLED_VOLUME.to_string(),
            name => name.to_string(),
        };

        Self {
            volume_path,
            volume_name,
            total_bytes,
            free_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            read_bytes_per_second: 0,
            write_bytes_per_second: 0,
        }
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        clamp_percentage(self.used_bytes as f64 / self.total_bytes as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkMetrics {
    pub upload_bytes_per_second: u64,
    pub download_bytes_per_second: u64,
    pub total_upload_bytes: u64,
    pub total_download_bytes: u64,
}

/// One poll cycle's worth of metrics. Published as a whole, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMetrics {
    pub timestamp: Instant,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
}

/// Resolve a user supplied volume path to an absolute one.
pub fn normalize_volume_path(path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        PathBuf::from(format!("/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_usage_is_user_plus_system() {
        let cpu = CpuMetrics::new(12.5, 7.25, 80.25);
        assert_eq!(cpu.usage_percentage, cpu.user_usage + cpu.system_usage);
        assert_eq!(cpu.usage_percentage, 19.75);
    }

    #[test]
    fn cpu_values_are_clamped() {
        let cpu = CpuMetrics::new(-3.0, 140.0, f64::NAN);
        assert_eq!(cpu.user_usage, 0.0);
        assert_eq!(cpu.system_usage, 100.0);
        assert_eq!(cpu.idle_percentage, 0.0);
    }

    #[test]
    fn memory_total_floor() {
        let memory = MemoryMetrics::new(0, 10, 0, 0);
        assert_eq!(memory.total_bytes, 1);
        assert_eq!(memory.usage_percentage(), 100.0);
    }

    #[test]
    fn disk_metrics_normalize_path_and_name() {
        let disk = DiskMetrics::new("Volumes/Backup", "  ", 1_000, 400);
        assert_eq!(disk.volume_path, "/Volumes/Backup");
        assert_eq!(disk.volume_name, UNTITLED_VOLUME);
        assert_eq!(disk.used_bytes, 600);
        assert!((disk.usage_percentage() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn disk_used_never_underflows() {
        let disk = DiskMetrics::new("/", "Macintosh HD", 100, 150);
        assert_eq!(disk.used_bytes, 0);
        assert_eq!(DiskMetrics::new("/", "x", 0, 0).usage_percentage(), 0.0);
    }
}
