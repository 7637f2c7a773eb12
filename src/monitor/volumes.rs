use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::Disks;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// A filesystem as reported by the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub mount_point: PathBuf,
    /// Filesystem label, empty when the filesystem has none.
    pub label: String,
    /// Device node without the `/dev/` prefix, e.g. `disk1s1` or `nvme0n1p2`.
    pub device: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub removable: bool,
}

/// Enumerates mounted filesystems.
pub trait VolumeTable: Send {
    fn mounts(&mut self) -> Vec<MountedVolume>;
}

/// Mount table backed by `sysinfo::Disks`.
#[derive(Debug, Default)]
pub struct SysinfoVolumes;

impl VolumeTable for SysinfoVolumes {
    fn mounts(&mut self) -> Vec<MountedVolume> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .map(|disk| {
                let name = disk.name().to_string_lossy();
                // Linux reports the device node as the name, macOS the label.
                let (label, mut device) = match name.strip_prefix("/dev/") {
                    Some(device) => (String::new(), device.to_string()),
                    None if name.starts_with('/') => (String::new(), String::new()),
                    None => (name.to_string(), String::new()),
                };
                if device.is_empty() {
                    if let Some(source) = mounted_from(disk.mount_point()) {
                        device = device_from_source(&source);
                    }
                }
                MountedVolume {
                    mount_point: disk.mount_point().to_path_buf(),
                    label,
                    device,
                    total_bytes: disk.total_space(),
                    available_bytes: disk.available_space(),
                    removable: disk.is_removable(),
                }
            })
            .collect()
    }
}

/// `/dev/disk1s1` -> `disk1s1`. Sources that are not device nodes, such as
/// `map auto_home` or `devfs`, give an empty name.
fn device_from_source(source: &str) -> String {
    source
        .strip_prefix("/dev/")
        .map(str::to_string)
        .unwrap_or_default()
}

/// A NUL-terminated fixed-size `statfs` name field.
#[cfg_attr(
    not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )),
    allow(dead_code)
)]
fn c_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// What `mount_point` was mounted from, e.g. `/dev/disk3s1`.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn mounted_from(mount_point: &Path) -> Option<String> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let path = CString::new(mount_point.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statfs>::zeroed();
    // SAFETY: path is NUL-terminated and stat is valid for writes.
    if unsafe { libc::statfs(path.as_ptr(), stat.as_mut_ptr()) } != 0 {
        tracing::debug!(
            mount_point = %mount_point.display(),
            error = %std::io::Error::last_os_error(),
            "statfs failed"
        );
        return None;
    }
    // SAFETY: statfs returned 0 and filled the struct.
    let stat = unsafe { stat.assume_init() };
    Some(c_field(&stat.f_mntfromname))
}

/// sysinfo already names the device node here.
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn mounted_from(_mount_point: &Path) -> Option<String> {
    None
}

/// The mounted volume whose mount point is the longest prefix of `path`.
pub fn volume_for_path<'a>(mounts: &'a [MountedVolume], path: &Path) -> Option<&'a MountedVolume> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Root and system volumes sort before external ones.
pub fn is_internal_volume(path: &str) -> bool {
    path == "/"
        || path.starts_with("/System")
        || path.starts_with("/boot")
        || path.starts_with("/private")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    Mounted(PathBuf),
    Unmounted(PathBuf),
}

/// Fan-out channel for volume attach/detach events.
///
/// A platform adapter publishes; the disk and disk health monitors listen.
#[derive(Debug, Clone)]
pub struct VolumeEvents {
    sender: broadcast::Sender<VolumeEvent>,
}

impl VolumeEvents {
    const CAPACITY: usize = 32;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    /// Returns the number of listeners that received the event.
    pub fn publish(&self, event: VolumeEvent) -> usize {
        tracing::debug!(?event, "volume event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.sender.subscribe()
    }
}

impl Default for VolumeEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns mount table changes into [`VolumeEvent`]s.
///
/// Stand-in for OS volume arbitration on platforms without a push source.
pub struct MountWatcher {
    table: Box<dyn VolumeTable>,
    known: BTreeSet<PathBuf>,
}

impl MountWatcher {
    pub fn new(table: Box<dyn VolumeTable>) -> Self {
        let mut watcher = Self {
            table,
            known: BTreeSet::new(),
        };
        watcher.known = watcher.mount_points();
        watcher
    }

    fn mount_points(&mut self) -> BTreeSet<PathBuf> {
        self.table
            .mounts()
            .into_iter()
            .map(|m| m.mount_point)
            .collect()
    }

    /// Compare the mount table against the last scan.
    pub fn scan(&mut self) -> Vec<VolumeEvent> {
        let current = self.mount_points();
        let mut events: Vec<VolumeEvent> = current
            .difference(&self.known)
            .cloned()
            .map(VolumeEvent::Mounted)
            .collect();
        events.extend(
            self.known
                .difference(&current)
                .cloned()
                .map(VolumeEvent::Unmounted),
        );
        self.known = current;
        events
    }

    /// Scan every `period` and publish changes until cancelled.
    pub async fn run(mut self, events: VolumeEvents, period: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let (watcher, changes) = match tokio::task::spawn_blocking(move || {
                        let changes = self.scan();
                        (self, changes)
                    })
                    .await
                    {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::warn!(error = %e, "mount table scan failed");
                            return;
                        }
                    };
                    self = watcher;
                    for change in changes {
                        events.publish(change);
                    }
                }
            }
        }
    }
}
