use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use sysinfo::{Pid, ProcessesToUpdate, System};

use super::clamp_percentage;
use crate::error::TerminateError;

/// PIDs below this belong to the kernel and early launch processes.
pub const LOW_PID_THRESHOLD: u32 = 100;

/// Processes the user must never be able to terminate from the menu.
static PROTECTED_PROCESSES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "kernel_task",
        "launchd",
        "WindowServer",
        "loginwindow",
        "Finder",
        "Dock",
        "SystemUIServer",
        "coreaudiod",
        "mds",
        "mds_stores",
        "opendirectoryd",
        "securityd",
        "configd",
        "syslogd",
        "notifyd",
        "distnoted",
        "cfprefsd",
        "systemd",
        "init",
        "kthreadd",
        "dbus-daemon",
        "Xorg",
        "Xwayland",
        "gnome-shell",
        "pipewire",
        "pulseaudio",
    ]
    .into_iter()
    .collect()
});

pub fn is_protected_name(name: &str) -> bool {
    PROTECTED_PROCESSES.contains(name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub id: u32,
    pub name: String,
    pub bundle_identifier: Option<String>,
    /// Clamped to `[0, 100]`.
    pub cpu_usage: f64,
    pub memory_usage: u64,
    /// Application bundle the icon is loaded from.
    pub icon: Option<PathBuf>,
}

impl ProcessInfo {
    pub fn is_terminable(&self) -> bool {
        self.id >= LOW_PID_THRESHOLD && !is_protected_name(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessSort {
    #[default]
    Cpu,
    Memory,
}

/// Access to the OS process table.
pub trait ProcessTable: Send {
    /// Every live process, in enumeration order.
    fn processes(&mut self) -> Vec<ProcessInfo>;

    fn process(&mut self, pid: u32) -> Option<ProcessInfo>;

    /// Ask the process to exit.
    fn terminate(&mut self, pid: u32) -> io::Result<()>;
}

/// Process table backed by `sysinfo`.
pub struct SysinfoProcesses {
    system: System,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        let mut system = System::new();
        // Baseline so the first listing has CPU usage
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self { system }
    }

    fn info(pid: Pid, process: &sysinfo::Process) -> Option<ProcessInfo> {
        let id = pid.as_u32();
        let name = process.name().to_string_lossy().into_owned();
        if id == 0 || name.is_empty() {
            return None;
        }

        let bundle = process.exe().and_then(app_bundle);
        Some(ProcessInfo {
            id,
            name,
            bundle_identifier: bundle.as_deref().and_then(bundle_identifier),
            cpu_usage: clamp_percentage(process.cpu_usage() as f64),
            memory_usage: process.memory(),
            icon: bundle,
        })
    }
}

impl Default for SysinfoProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcesses {
    fn processes(&mut self) -> Vec<ProcessInfo> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let mut all: Vec<ProcessInfo> = self
            .system
            .processes()
            .iter()
            .filter_map(|(pid, process)| Self::info(*pid, process))
            .collect();
        all.sort_by_key(|p| p.id);
        all
    }

    fn process(&mut self, pid: u32) -> Option<ProcessInfo> {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system
            .process(pid)
            .and_then(|process| Self::info(pid, process))
    }

    #[cfg(unix)]
    fn terminate(&mut self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill has no memory preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self, pid: u32) -> io::Result<()> {
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) if process.kill_with(sysinfo::Signal::Term).unwrap_or(false) => Ok(()),
            Some(_) => Err(io::Error::new(io::ErrorKind::Other, "signal not delivered")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such process")),
        }
    }
}

/// The `.app` bundle containing an executable, if any.
fn app_bundle(exe: &Path) -> Option<PathBuf> {
    exe.ancestors()
        .find(|p| p.extension().is_some_and(|ext| ext == "app"))
        .map(Path::to_path_buf)
}

fn bundle_identifier(bundle: &Path) -> Option<String> {
    let plist = fs::read_to_string(bundle.join("Contents/Info.plist")).ok()?;
    plist_bundle_identifier(&plist)
}

/// `CFBundleIdentifier` from an XML property list. Binary plists yield `None`.
fn plist_bundle_identifier(plist: &str) -> Option<String> {
    let after_key = plist.split_once("<key>CFBundleIdentifier</key>")?.1;
    let value = after_key.trim_start().strip_prefix("<string>")?;
    let (identifier, _) = value.split_once("</string>")?;
    let identifier = identifier.trim();
    (!identifier.is_empty()).then(|| identifier.to_string())
}

/// Ranks processes and terminates them with a guard for system processes.
pub struct ProcessMonitor {
    table: Box<dyn ProcessTable>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::with_table(Box::new(SysinfoProcesses::new()))
    }

    pub fn with_table(table: Box<dyn ProcessTable>) -> Self {
        Self { table }
    }

    /// The `limit` heaviest processes by `sort_by`, heaviest first. Ties
    /// keep enumeration order.
    pub fn top_processes(&mut self, sort_by: ProcessSort, limit: usize) -> Vec<ProcessInfo> {
        if limit == 0 {
            return Vec::new();
        }

        let mut processes = self.table.processes();
        match sort_by {
            ProcessSort::Cpu => processes.sort_by(|a, b| b.cpu_usage.total_cmp(&a.cpu_usage)),
            ProcessSort::Memory => processes.sort_by(|a, b| b.memory_usage.cmp(&a.memory_usage)),
        }
        processes.truncate(limit);
        processes
    }

    /// Low PIDs, protected names and processes whose name cannot be
    /// resolved are all critical.
    pub fn is_system_critical(&mut self, pid: u32) -> bool {
        if pid < LOW_PID_THRESHOLD {
            return true;
        }
        match self.table.process(pid) {
            Some(info) => is_protected_name(&info.name),
            None => true,
        }
    }

    pub fn terminate_process(&mut self, pid: u32) -> Result<(), TerminateError> {
        if self.is_system_critical(pid) {
            tracing::warn!(pid, "refusing to terminate system-critical process");
            return Err(TerminateError::SystemCritical(pid));
        }

        let info = self
            .table
            .process(pid)
            .ok_or(TerminateError::NotFound(pid))?;

        match self.table.terminate(pid) {
            Ok(()) => {
                tracing::info!(pid, name = %info.name, "sent SIGTERM");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(TerminateError::InsufficientPermissions(pid))
            }
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) || e.kind() == io::ErrorKind::NotFound => {
                Err(TerminateError::NotFound(pid))
            }
            Err(e) => Err(TerminateError::Failed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    pub fn process_info(&mut self, pid: u32) -> Option<ProcessInfo> {
        self.table.process(pid)
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeTable {
        processes: Vec<ProcessInfo>,
        signalled: Arc<Mutex<Vec<u32>>>,
        failure: Option<io::ErrorKind>,
        raw_failure: Option<i32>,
    }

    impl ProcessTable for FakeTable {
        fn processes(&mut self) -> Vec<ProcessInfo> {
            self.processes.clone()
        }

        fn process(&mut self, pid: u32) -> Option<ProcessInfo> {
            self.processes.iter().find(|p| p.id == pid).cloned()
        }

        fn terminate(&mut self, pid: u32) -> io::Result<()> {
            self.signalled.lock().unwrap().push(pid);
            if let Some(code) = self.raw_failure {
                return Err(io::Error::from_raw_os_error(code));
            }
            match self.failure {
                Some(kind) => Err(io::Error::new(kind, "denied")),
                None => Ok(()),
            }
        }
    }

    fn proc(id: u32, name: &str, cpu_usage: f64, memory_usage: u64) -> ProcessInfo {
        ProcessInfo {
            id,
            name: name.to_string(),
            bundle_identifier: None,
            cpu_usage,
            memory_usage,
            icon: None,
        }
    }

    fn table() -> FakeTable {
        FakeTable {
            processes: vec![
                proc(1, "launchd", 0.5, 10_000),
                proc(120, "WindowServer", 12.0, 400_000),
                proc(501, "Safari", 30.0, 900_000),
                proc(502, "Terminal", 2.0, 100_000),
                proc(503, "cargo", 30.0, 50_000),
                proc(504, "rustc", 85.5, 2_000_000),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn top_by_cpu_is_descending_and_stable() {
        let mut monitor = ProcessMonitor::with_table(Box::new(table()));
        let top = monitor.top_processes(ProcessSort::Cpu, 4);
        let ids: Vec<u32> = top.iter().map(|p| p.id).collect();
        // Safari and cargo tie at 30%; enumeration order is kept.
        assert_eq!(ids, vec![504, 501, 503, 120]);

        for limit in 0..8 {
            let top = monitor.top_processes(ProcessSort::Cpu, limit);
            assert_eq!(top.len(), limit.min(6));
            assert!(top.windows(2).all(|w| w[0].cpu_usage >= w[1].cpu_usage));
        }
    }

    #[test]
    fn top_by_memory() {
        let mut monitor = ProcessMonitor::with_table(Box::new(table()));
        let top = monitor.top_processes(ProcessSort::Memory, 2);
        let ids: Vec<u32> = top.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![504, 501]);
    }

    #[test]
    fn zero_limit_is_empty() {
        let mut monitor = ProcessMonitor::with_table(Box::new(table()));
        assert!(monitor.top_processes(ProcessSort::Memory, 0).is_empty());
    }

    #[test]
    fn critical_processes() {
        let mut monitor = ProcessMonitor::with_table(Box::new(table()));
        assert!(monitor.is_system_critical(1));
        assert!(monitor.is_system_critical(99));
        assert!(monitor.is_system_critical(120));
        assert!(monitor.is_system_critical(9_999));
        assert!(!monitor.is_system_critical(501));
    }

    #[test]
    fn low_pids_are_never_signalled() {
        let table = table();
        let signalled = table.signalled.clone();
        let mut monitor = ProcessMonitor::with_table(Box::new(table));
        for pid in 0..LOW_PID_THRESHOLD {
            assert_eq!(
                monitor.terminate_process(pid),
                Err(TerminateError::SystemCritical(pid))
            );
        }
        assert_eq!(
            monitor.terminate_process(120),
            Err(TerminateError::SystemCritical(120))
        );
        assert!(signalled.lock().unwrap().is_empty());
    }

    #[test]
    fn terminates_ordinary_process() {
        let table = table();
        let signalled = table.signalled.clone();
        let mut monitor = ProcessMonitor::with_table(Box::new(table));
        assert_eq!(monitor.terminate_process(502), Ok(()));
        assert_eq!(*signalled.lock().unwrap(), vec![502]);
    }

    #[test]
    fn permission_failure() {
        let mut table = table();
        table.failure = Some(io::ErrorKind::PermissionDenied);
        let mut monitor = ProcessMonitor::with_table(Box::new(table));
        assert_eq!(
            monitor.terminate_process(501),
            Err(TerminateError::InsufficientPermissions(501))
        );
    }

    #[test]
    fn vanished_process_is_not_found() {
        let mut table = table();
        table.raw_failure = Some(libc::ESRCH);
        let mut monitor = ProcessMonitor::with_table(Box::new(table));
        assert_eq!(
            monitor.terminate_process(503),
            Err(TerminateError::NotFound(503))
        );
    }

    #[test]
    fn other_failures_carry_reason() {
        let mut table = table();
        table.failure = Some(io::ErrorKind::Other);
        let mut monitor = ProcessMonitor::with_table(Box::new(table));
        match monitor.terminate_process(504) {
            Err(TerminateError::Failed { pid, reason }) => {
                assert_eq!(pid, 504);
                assert!(reason.contains("denied"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminable_flag() {
        assert!(!proc(50, "bash", 0.0, 0).is_terminable());
        assert!(!proc(400, "Finder", 0.0, 0).is_terminable());
        assert!(proc(400, "bash", 0.0, 0).is_terminable());
    }

    #[test]
    fn process_info_lookup() {
        let mut monitor = ProcessMonitor::with_table(Box::new(table()));
        assert_eq!(monitor.process_info(502).unwrap().name, "Terminal");
        assert!(monitor.process_info(4_242).is_none());
    }

    #[test]
    fn bundle_from_exe_path() {
        let exe = Path::new("/Applications/Safari.app/Contents/MacOS/Safari");
        assert_eq!(
            app_bundle(exe),
            Some(PathBuf::from("/Applications/Safari.app"))
        );
        assert_eq!(app_bundle(Path::new("/usr/bin/top")), None);
    }

    #[test]
    fn bundle_identifier_from_plist() {
        let plist = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleName</key>
    <string>Safari</string>
    <key>CFBundleIdentifier</key>
    <string>com.apple.Safari</string>
</dict>
</plist>"#;
        assert_eq!(
            plist_bundle_identifier(plist).as_deref(),
            Some("com.apple.Safari")
        );
        assert_eq!(plist_bundle_identifier("bplist00..."), None);

        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Demo.app");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();
        std::fs::write(bundle.join("Contents/Info.plist"), plist).unwrap();
        assert_eq!(
            bundle_identifier(&bundle).as_deref(),
            Some("com.apple.Safari")
        );
    }

    #[test]
    fn lists_real_processes() {
        let mut monitor = ProcessMonitor::new();
        let own = std::process::id();
        let top = monitor.top_processes(ProcessSort::Memory, usize::MAX);
        assert!(top.iter().any(|p| p.id == own));
        assert!(top.iter().all(|p| !p.name.is_empty() && p.id > 0));
        assert!(top.iter().all(|p| (0.0..=100.0).contains(&p.cpu_usage)));
    }
}
