use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::volumes::{is_internal_volume, volume_for_path, MountedVolume, SysinfoVolumes, VolumeTable};
use super::{VolumeEvents, UNTITLED_VOLUME};

/// A hardware attribute that the drive may or may not report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Attribute<T> {
    Available(T),
    #[default]
    Unavailable,
}

impl<T: Copy> Attribute<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Self::Available(v) => Some(*v),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn value_or(&self, default: T) -> T {
        self.value().unwrap_or(default)
    }
}

impl<T> From<Option<T>> for Attribute<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Available(v),
            None => Self::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Good,
    Warning,
    Critical,
    Unavailable,
}

/// What the drive's SMART data says.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmartReport {
    /// `"Verified"` or `"Failing"`; `None` when the drive reports no verdict.
    pub status: Option<String>,
    pub power_on_hours: Attribute<u64>,
    pub temperature: Attribute<i64>,
    pub read_errors: Attribute<u64>,
    pub write_errors: Attribute<u64>,
    pub reallocated_sectors: Attribute<u64>,
}

pub trait SmartProvider: Send {
    /// SMART data for a whole disk such as `disk1` or `sda`.
    fn query(&mut self, device: &str) -> Option<SmartReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskHealthInfo {
    /// Mount point of the volume.
    pub id: String,
    pub volume_name: String,
    pub bsd_name: String,
    pub status: HealthStatus,
    pub power_on_hours: Attribute<u64>,
    pub temperature: Attribute<i64>,
    pub read_error_count: Attribute<u64>,
    pub write_error_count: Attribute<u64>,
    pub reallocated_sector_count: Attribute<u64>,
}

pub fn determine_status(
    smart_status: Option<&str>,
    read_errors: u64,
    write_errors: u64,
    reallocated_sectors: u64,
) -> HealthStatus {
    let Some(smart_status) = smart_status else {
        return HealthStatus::Unavailable;
    };

    if smart_status == "Failing" || reallocated_sectors > 50 {
        HealthStatus::Critical
    } else if read_errors > 10 || write_errors > 10 || reallocated_sectors > 10 {
        HealthStatus::Warning
    } else {
        HealthStatus::Good
    }
}

/// Strip the partition suffix: `disk1s1 -> disk1`, `nvme0n1p2 -> nvme0n1`,
/// `sda1 -> sda`.
pub fn whole_disk_name(device: &str) -> &str {
    if let Some(rest) = device.strip_prefix("disk") {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        return &device[.."disk".len() + digits];
    }

    if device.starts_with("nvme") || device.starts_with("mmcblk") {
        if let Some(p) = device.rfind('p') {
            let (base, suffix) = device.split_at(p);
            let is_partition = suffix.len() > 1
                && suffix[1..].chars().all(|c| c.is_ascii_digit())
                && base.ends_with(|c: char| c.is_ascii_digit());
            if is_partition {
                return base;
            }
        }
        return device;
    }

    let trimmed = device.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.is_empty() {
        device
    } else {
        trimmed
    }
}

/// Resolves volumes to devices and classifies their health.
pub struct DiskHealthMonitor {
    volumes: Box<dyn VolumeTable>,
    smart: Box<dyn SmartProvider>,
    updates: broadcast::Sender<Vec<DiskHealthInfo>>,
}

impl DiskHealthMonitor {
    pub fn new() -> Self {
        Self::with_sources(Box::new(SysinfoVolumes), Box::new(SmartctlProvider::default()))
    }

    pub fn with_sources(volumes: Box<dyn VolumeTable>, smart: Box<dyn SmartProvider>) -> Self {
        let (updates, _) = broadcast::channel(8);
        Self {
            volumes,
            smart,
            updates,
        }
    }

    /// `None` when the path does not resolve to a device.
    pub fn health_info(&mut self, path: &Path) -> Option<DiskHealthInfo> {
        let mounts = self.volumes.mounts();
        let volume = volume_for_path(&mounts, path)?;
        self.build_info(volume)
    }

    fn build_info(&mut self, volume: &MountedVolume) -> Option<DiskHealthInfo> {
        if volume.device.is_empty() {
            return None;
        }

        let volume_name = if !volume.label.is_empty() {
            volume.label.clone()
        } else {
            volume
                .mount_point
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| UNTITLED_VOLUME.to_string())
        };

        let report = self
            .smart
            .query(whole_disk_name(&volume.device))
            .unwrap_or_default();

        let status = determine_status(
            report.status.as_deref(),
            report.read_errors.value_or(0),
            report.write_errors.value_or(0),
            report.reallocated_sectors.value_or(0),
        );

        Some(DiskHealthInfo {
            id: volume.mount_point.to_string_lossy().into_owned(),
            volume_name,
            bsd_name: volume.device.clone(),
            status,
            power_on_hours: report.power_on_hours,
            temperature: report.temperature,
            read_error_count: report.read_errors,
            write_error_count: report.write_errors,
            reallocated_sector_count: report.reallocated_sectors,
        })
    }

    /// Health of every mounted volume, internal volumes first, then by name.
    /// Removable media count as external wherever they are mounted.
    pub fn all_volumes_health(&mut self) -> Vec<DiskHealthInfo> {
        let mounts: BTreeMap<PathBuf, MountedVolume> = self
            .volumes
            .mounts()
            .into_iter()
            .map(|m| (m.mount_point.clone(), m))
            .collect();

        let mut all: Vec<(bool, DiskHealthInfo)> = mounts
            .values()
            .filter_map(|volume| {
                let external = volume.removable
                    || !is_internal_volume(&volume.mount_point.to_string_lossy());
                self.build_info(volume).map(|info| (external, info))
            })
            .collect();

        all.sort_by(|(a_external, a), (b_external, b)| {
            a_external
                .cmp(b_external)
                .then_with(|| a.volume_name.cmp(&b.volume_name))
        });
        all.into_iter().map(|(_, info)| info).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DiskHealthInfo>> {
        self.updates.subscribe()
    }

    pub fn on_volume_change(&mut self) -> Vec<DiskHealthInfo> {
        let all = self.all_volumes_health();
        let _ = self.updates.send(all.clone());
        all
    }

    pub fn listen(monitor: Arc<Mutex<DiskHealthMonitor>>, events: &VolumeEvents) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        tracing::info!(?event, "volumes changed, re-checking disk health");
                        let monitor = monitor.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            monitor
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .on_volume_change()
                        })
                        .await;
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "disk health re-check failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "volume events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for DiskHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads SMART data through `smartctl --json`.
#[derive(Debug, Clone)]
pub struct SmartctlProvider {
    program: PathBuf,
}

impl SmartctlProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SmartctlProvider {
    fn default() -> Self {
        Self::new("smartctl")
    }
}

impl SmartProvider for SmartctlProvider {
    fn query(&mut self, device: &str) -> Option<SmartReport> {
        // smartctl encodes drive warnings in its exit status, so only the
        // output matters.
        let output = Command::new(&self.program)
            .args(["--json", "-H", "-A"])
            .arg(format!("/dev/{device}"))
            .output();

        match output {
            Ok(output) => parse_smartctl_json(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                tracing::debug!(device, error = %e, "smartctl unavailable");
                None
            }
        }
    }
}

fn parse_smartctl_json(content: &str) -> Option<SmartReport> {
    let json: Value = serde_json::from_str(content).ok()?;

    let status = json["smart_status"]["passed"]
        .as_bool()
        .map(|passed| if passed { "Verified" } else { "Failing" }.to_string());

    let ata_raw = |id: u64| -> Option<u64> {
        json["ata_smart_attributes"]["table"]
            .as_array()?
            .iter()
            .find(|attr| attr["id"].as_u64() == Some(id))?["raw"]["value"]
            .as_u64()
    };
    let nvme = &json["nvme_smart_health_information_log"];

    Some(SmartReport {
        status,
        power_on_hours: json["power_on_time"]["hours"].as_u64().into(),
        temperature: json["temperature"]["current"].as_i64().into(),
        read_errors: ata_raw(187).or_else(|| nvme["media_errors"].as_u64()).into(),
        write_errors: ata_raw(200).into(),
        reallocated_sectors: ata_raw(5).into(),
    })
}
