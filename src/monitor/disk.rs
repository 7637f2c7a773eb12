use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::volumes::{volume_for_path, MountedVolume, SysinfoVolumes, VolumeTable};
use super::{normalize_volume_path, Collector, DiskMetrics, RateTracker, VolumeEvents};
use crate::error::{CollectError, Result};
use crate::settings::Settings;

/// Cumulative bytes moved by all block devices since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoCounters {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Where the block device I/O counters come from.
pub trait IoCounterSource: Send {
    fn read_counters(&mut self) -> Result<IoCounters>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub path: String,
    pub name: String,
}

#[derive(Default)]
struct IoRates {
    read: RateTracker,
    write: RateTracker,
}

/// Disk capacity and I/O throughput for a volume path.
pub struct DiskMonitor {
    volumes: Box<dyn VolumeTable>,
    io: Box<dyn IoCounterSource>,
    /// Volume reported to the coordinator.
    volume_path: PathBuf,
    capacity_cache: HashMap<PathBuf, (Instant, DiskMetrics)>,
    io_rates: HashMap<PathBuf, IoRates>,
    updates: broadcast::Sender<Vec<DiskMetrics>>,
}

impl DiskMonitor {
    /// How long a capacity reading is reused for the same path.
    pub const CACHE_TTL: Duration = Duration::from_secs(1);

    pub fn new(volume_path: impl Into<PathBuf>) -> Self {
        Self::with_sources(
            volume_path,
            Box::new(SysinfoVolumes),
            Box::new(platform::DefaultIoSource::new()),
        )
    }

    pub fn with_sources(
        volume_path: impl Into<PathBuf>,
        volumes: Box<dyn VolumeTable>,
        io: Box<dyn IoCounterSource>,
    ) -> Self {
        let (updates, _) = broadcast::channel(8);
        Self {
            volumes,
            io,
            volume_path: volume_path.into(),
            capacity_cache: HashMap::new(),
            io_rates: HashMap::new(),
            updates,
        }
    }

    pub fn volume_path(&self) -> &Path {
        &self.volume_path
    }

    pub fn set_volume_path(&mut self, path: impl Into<PathBuf>) {
        self.volume_path = path.into();
    }

    pub fn collect_path(&mut self, path: &Path) -> Result<DiskMetrics> {
        self.collect_path_at(path, Instant::now())
    }

    pub(crate) fn collect_path_at(&mut self, path: &Path, now: Instant) -> Result<DiskMetrics> {
        let path = normalize_volume_path(&path.to_string_lossy());
        if !path.exists() {
            return Err(CollectError::PathNotFound(path));
        }

        let mut metrics = self.capacity(&path, now)?;

        let (read, write) = match self.io.read_counters() {
            Ok(counters) => {
                // Counters are system wide, so every path sees the same throughput.
                let rates = self.io_rates.entry(path.clone()).or_default();
                (
                    rates.read.update_u64(counters.bytes_read, now),
                    rates.write.update_u64(counters.bytes_written, now),
                )
            }
            Err(e) => {
                tracing::debug!(error = %e, "disk io counters unavailable");
                (0, 0)
            }
        };
        metrics.read_bytes_per_second = read;
        metrics.write_bytes_per_second = write;

        Ok(metrics)
    }

    fn capacity(&mut self, path: &Path, now: Instant) -> Result<DiskMetrics> {
        if let Some((at, cached)) = self.capacity_cache.get(path) {
            if now.saturating_duration_since(*at) < Self::CACHE_TTL {
                return Ok(cached.clone());
            }
        }

        let mounts = self.volumes.mounts();
        let volume = volume_for_path(&mounts, path).ok_or_else(|| {
            CollectError::InvalidData(format!("no filesystem mounted at {}", path.display()))
        })?;

        let name = if volume.label.is_empty() {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            volume.label.clone()
        };

        let metrics = DiskMetrics::new(
            &path.to_string_lossy(),
            &name,
            volume.total_bytes,
            volume.available_bytes,
        );
        self.capacity_cache
            .insert(path.to_path_buf(), (now, metrics.clone()));
        Ok(metrics)
    }

    /// Mounted volumes sorted by path. The root volume is always listed.
    pub fn list_volumes(&mut self) -> Vec<VolumeInfo> {
        let mut volumes: Vec<VolumeInfo> = self
            .volumes
            .mounts()
            .iter()
            .map(volume_info)
            .collect();

        if !volumes.iter().any(|v| v.path == "/") {
            volumes.push(VolumeInfo {
                path: "/".to_string(),
                name: super::UNTITLED_VOLUME.to_string(),
            });
        }

        volumes.sort_by(|a, b| a.path.cmp(&b.path));
        volumes.dedup_by(|a, b| a.path == b.path);
        volumes
    }

    /// Receive fresh metrics for every volume after each attach or detach.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DiskMetrics>> {
        self.updates.subscribe()
    }

    /// Re-collect all volumes and notify subscribers.
    pub fn on_volume_change(&mut self) -> Vec<DiskMetrics> {
        self.capacity_cache.clear();
        let paths: Vec<PathBuf> = self
            .list_volumes()
            .into_iter()
            .map(|v| PathBuf::from(v.path))
            .collect();

        let all: Vec<DiskMetrics> = paths
            .iter()
            .filter_map(|path| match self.collect_path(path) {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping volume");
                    None
                }
            })
            .collect();

        let _ = self.updates.send(all.clone());
        all
    }

    /// Re-collect on every event published on `events` until the bus closes.
    pub fn listen(monitor: Arc<Mutex<DiskMonitor>>, events: &VolumeEvents) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        tracing::info!(?event, "volumes changed, re-collecting disk metrics");
                        let monitor = monitor.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            monitor
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .on_volume_change()
                        })
                        .await;
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "disk re-collection failed");
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

fn volume_info(volume: &MountedVolume) -> VolumeInfo {
    let path = volume.mount_point.to_string_lossy().into_owned();
    let name = if !volume.label.is_empty() {
        volume.label.clone()
    } else {
        volume
            .mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| super::UNTITLED_VOLUME.to_string())
    };
    VolumeInfo { path, name }
}

impl Collector for DiskMonitor {
    type Output = DiskMetrics;

    fn name(&self) -> &'static str {
        "disk"
    }

    fn collect(&mut self) -> Result<DiskMetrics> {
        let path = self.volume_path.clone();
        self.collect_path(&path)
    }

    fn configure(&mut self, settings: &Settings) {
        if settings.disk_path != self.volume_path {
            tracing::info!(path = %settings.disk_path.display(), "disk path changed");
            self.set_volume_path(settings.disk_path.clone());
        }
    }
}

/// Check if a device name represents a physical (whole) device rather than a partition.
/// Handles traditional devices (sda, hda, vda), NVMe (nvme0n1), MMC (mmcblk0), etc.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn is_physical_device(device_name: &str) -> bool {
    // Skip virtual devices
    if device_name.starts_with("loop")
        || device_name.starts_with("ram")
        || device_name.starts_with("dm-")
    {
        return false;
    }

    // NVMe and MMC partitions carry a 'p' before the partition number
    if let Some(rest) = device_name
        .strip_prefix("nvme")
        .or_else(|| device_name.strip_prefix("mmcblk"))
    {
        let after_controller = rest.trim_start_matches(|c: char| c.is_ascii_digit());
        let after_namespace = after_controller
            .strip_prefix('n')
            .map(|s| s.trim_start_matches(|c: char| c.is_ascii_digit()))
            .unwrap_or(after_controller);
        return !after_namespace.starts_with('p');
    }

    // sda = base device, sda1 = partition
    device_name
        .chars()
        .last()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
}

/// Sum bytes read/written over whole devices in `/proc/diskstats`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_diskstats(content: &str) -> IoCounters {
    const SECTOR_BYTES: u64 = 512;

    let mut counters = IoCounters::default();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 || !is_physical_device(parts[2]) {
            continue;
        }

        // Field 6 is sectors read, field 10 is sectors written
        if let (Ok(read), Ok(write)) = (parts[5].parse::<u64>(), parts[9].parse::<u64>()) {
            counters.bytes_read = counters
                .bytes_read
                .saturating_add(read.saturating_mul(SECTOR_BYTES));
            counters.bytes_written = counters
                .bytes_written
                .saturating_add(write.saturating_mul(SECTOR_BYTES));
        }
    }
    counters
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{parse_diskstats, IoCounterSource, IoCounters};
    use crate::error::{CollectError, Result};
    use std::fs;

    /// Monitors disk I/O activity by reading /proc/diskstats
    pub struct DefaultIoSource;

    impl DefaultIoSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl IoCounterSource for DefaultIoSource {
        fn read_counters(&mut self) -> Result<IoCounters> {
            let content = fs::read_to_string("/proc/diskstats")
                .map_err(|e| CollectError::KernelUnavailable(format!("/proc/diskstats: {e}")))?;
            Ok(parse_diskstats(&content))
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::{IoCounterSource, IoCounters};
    use crate::error::Result;
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    /// Sums per-process disk usage as the closest portable stand-in for
    /// driver-level counters.
    pub struct DefaultIoSource {
        system: System,
    }

    impl DefaultIoSource {
        pub fn new() -> Self {
            Self {
                system: System::new(),
            }
        }
    }

    impl IoCounterSource for DefaultIoSource {
        fn read_counters(&mut self) -> Result<IoCounters> {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::new().with_disk_usage(),
            );
            let mut counters = IoCounters::default();
            for process in self.system.processes().values() {
                let usage = process.disk_usage();
                counters.bytes_read = counters.bytes_read.saturating_add(usage.total_read_bytes);
                counters.bytes_written =
                    counters.bytes_written.saturating_add(usage.total_written_bytes);
            }
            Ok(counters)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::volumes::tests::{mount, SharedTable};
    use crate::monitor::VolumeEvent;
    use std::collections::VecDeque;

    #[derive(Clone, Default)]
    struct ScriptedIo(Arc<Mutex<VecDeque<Result<IoCounters>>>>);

    impl ScriptedIo {
        fn push(&self, reading: Result<IoCounters>) {
            self.0.lock().unwrap().push_back(reading);
        }
    }

    impl IoCounterSource for ScriptedIo {
        fn read_counters(&mut self) -> Result<IoCounters> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CollectError::KernelUnavailable("IOBlockStorageDriver".into())))
        }
    }

    fn io(bytes_read: u64, bytes_written: u64) -> Result<IoCounters> {
        Ok(IoCounters {
            bytes_read,
            bytes_written,
        })
    }

    struct Fixture {
        dir: tempfile::TempDir,
        table: SharedTable,
        io: ScriptedIo,
        monitor: DiskMonitor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let table = SharedTable::default();
        {
            let mut mounts = table.0.lock().unwrap();
            mounts.push(mount("/", "", "sda2"));
            let mut data = mount(dir.path().to_str().unwrap(), "Scratch", "sdb1");
            data.total_bytes = 10_000;
            data.available_bytes = 4_000;
            mounts.push(data);
        }
        let io = ScriptedIo::default();
        let monitor =
            DiskMonitor::with_sources(dir.path(), Box::new(table.clone()), Box::new(io.clone()));
        Fixture {
            dir,
            table,
            io,
            monitor,
        }
    }

    #[test]
    fn capacity_from_mount_table() {
        let mut f = fixture();
        f.io.push(io(0, 0));
        let metrics = f.monitor.collect().unwrap();
        assert_eq!(metrics.volume_name, "Scratch");
        assert_eq!(metrics.total_bytes, 10_000);
        assert_eq!(metrics.free_bytes, 4_000);
        assert_eq!(metrics.used_bytes, 6_000);
        assert!(metrics.volume_path.starts_with('/'));
    }

    #[test]
    fn settings_switch_the_collected_volume() {
        let mut f = fixture();
        let settings = Settings {
            disk_path: PathBuf::from("/"),
            ..Settings::default()
        };
        f.monitor.configure(&settings);
        assert_eq!(f.monitor.volume_path(), Path::new("/"));
        f.io.push(io(0, 0));
        assert_eq!(f.monitor.collect().unwrap().volume_path, "/");
    }

    #[test]
    fn missing_path_is_path_not_found() {
        let mut f = fixture();
        let missing = f.dir.path().join("does-not-exist");
        assert!(matches!(
            f.monitor.collect_path(&missing),
            Err(CollectError::PathNotFound(_))
        ));
    }

    #[test]
    fn unmounted_path_is_invalid_data() {
        let mut f = fixture();
        f.table.0.lock().unwrap().clear();
        assert!(matches!(
            f.monitor.collect(),
            Err(CollectError::InvalidData(_))
        ));
    }

    #[test]
    fn name_falls_back_to_last_component() {
        let mut f = fixture();
        let sub = f.dir.path().join("photos");
        std::fs::create_dir(&sub).unwrap();
        f.table.0.lock().unwrap()[1].label.clear();
        let metrics = f.monitor.collect_path(&sub).unwrap();
        assert_eq!(metrics.volume_name, "photos");
    }

    #[test]
    fn io_rates_from_counter_deltas() {
        let mut f = fixture();
        let path = f.dir.path().to_path_buf();
        let start = Instant::now();
        f.io.push(io(1_000, 500));
        f.io.push(io(3_000, 1_500));

        let first = f.monitor.collect_path_at(&path, start).unwrap();
        assert_eq!(
            (first.read_bytes_per_second, first.write_bytes_per_second),
            (0, 0)
        );

        let second = f
            .monitor
            .collect_path_at(&path, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(second.read_bytes_per_second, 1_000);
        assert_eq!(second.write_bytes_per_second, 500);
    }

    #[test]
    fn io_failure_still_reports_capacity() {
        let mut f = fixture();
        let metrics = f.monitor.collect().unwrap();
        assert_eq!(metrics.read_bytes_per_second, 0);
        assert_eq!(metrics.write_bytes_per_second, 0);
        assert_eq!(metrics.total_bytes, 10_000);
    }

    #[test]
    fn capacity_is_cached_for_a_second() {
        let mut f = fixture();
        let path = f.dir.path().to_path_buf();
        let start = Instant::now();
        f.monitor.collect_path_at(&path, start).unwrap();

        f.table.0.lock().unwrap()[1].available_bytes = 1_000;
        let cached = f
            .monitor
            .collect_path_at(&path, start + Duration::from_millis(500))
            .unwrap();
        assert_eq!(cached.free_bytes, 4_000);

        let fresh = f
            .monitor
            .collect_path_at(&path, start + Duration::from_millis(1_500))
            .unwrap();
        assert_eq!(fresh.free_bytes, 1_000);
    }

    #[test]
    fn list_volumes_sorted_with_root() {
        let mut f = fixture();
        f.table.0.lock().unwrap().retain(|m| m.mount_point != Path::new("/"));
        f.table
            .0
            .lock()
            .unwrap()
            .push(mount("/Volumes/Archive", "Archive", "disk4s1"));

        let volumes = f.monitor.list_volumes();
        assert_eq!(volumes[0].path, "/");
        assert!(volumes.windows(2).all(|w| w[0].path < w[1].path));
        assert!(volumes.iter().any(|v| v.name == "Archive"));
    }

    #[test]
    fn volume_change_recollects_and_notifies() {
        let mut f = fixture();
        let mut rx = f.monitor.subscribe();
        let all = f.monitor.on_volume_change();
        assert!(all.iter().any(|m| m.volume_name == "Scratch"));
        assert_eq!(rx.try_recv().unwrap(), all);
    }

    #[tokio::test]
    async fn listens_to_volume_events() {
        let f = fixture();
        let mut rx = f.monitor.subscribe();
        let monitor = Arc::new(Mutex::new(f.monitor));
        let events = VolumeEvents::new();
        let handle = DiskMonitor::listen(monitor, &events);

        events.publish(VolumeEvent::Mounted(PathBuf::from("/Volumes/USB")));
        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!update.is_empty());

        drop(events);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        drop(f.dir);
    }

    #[test]
    fn physical_devices() {
        assert!(is_physical_device("sda"));
        assert!(!is_physical_device("sda1"));
        assert!(is_physical_device("nvme0n1"));
        assert!(!is_physical_device("nvme0n1p2"));
        assert!(is_physical_device("mmcblk0"));
        assert!(!is_physical_device("mmcblk0p1"));
        assert!(!is_physical_device("loop0"));
        assert!(!is_physical_device("dm-0"));
    }

    #[test]
    fn parses_diskstats() {
        let content = "   8       0 sda 100 0 2000 0 50 0 4000 0 0 0 0\n\
                          8       1 sda1 100 0 2000 0 50 0 4000 0 0 0 0\n\
                        259       0 nvme0n1 10 0 10 0 10 0 30 0 0 0 0\n\
                          7       0 loop0 1 0 99 0 1 0 99 0 0 0 0\n";
        let counters = parse_diskstats(content);
        assert_eq!(counters.bytes_read, (2000 + 10) * 512);
        assert_eq!(counters.bytes_written, (4000 + 30) * 512);
    }

    #[test]
    fn default_sources_collect_quickly() {
        let mut disk = DiskMonitor::new("/");
        let start = Instant::now();
        if let Ok(metrics) = disk.collect() {
            assert!(metrics.total_bytes > 0);
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
    }
}
