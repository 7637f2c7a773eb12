use ini::{Ini, Properties};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SettingsError;

pub const MIN_REFRESH_INTERVAL: f64 = 1.0;
pub const MAX_REFRESH_INTERVAL: f64 = 5.0;
pub const DEFAULT_REFRESH_INTERVAL: f64 = 2.0;

const SECTION: &str = "monitor";

/// Clamp a poll interval in seconds into the supported range.
pub fn clamp_refresh_interval(seconds: f64) -> f64 {
    if seconds.is_nan() {
        DEFAULT_REFRESH_INTERVAL
    } else {
        seconds.clamp(MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL)
    }
}

/// Monitor configuration (parsed from settings.ini)
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Seconds between snapshots, within `[1.0, 5.0]`
    pub refresh_interval: f64,
    /// Absolute path of the volume shown in the disk metric
    pub disk_path: PathBuf,
    pub enable_cpu: bool,
    pub enable_memory: bool,
    pub enable_disk: bool,
    pub enable_network: bool,
    /// Seconds between process list refreshes
    pub process_interval: u64,
    /// Seconds between disk health checks
    pub health_interval: u64,
    /// Number of processes listed per refresh
    pub top_processes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            disk_path: PathBuf::from("/"),
            enable_cpu: true,
            enable_memory: true,
            enable_disk: true,
            enable_network: true,
            process_interval: 5,
            health_interval: 60,
            top_processes: 5,
        }
    }
}

impl Settings {
    /// `<config dir>/statbar/settings.ini`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "statbar")
            .map(|dirs| dirs.config_dir().join("settings.ini"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        Ok(Self::from_ini(&ini))
    }

    pub fn from_ini(ini: &Ini) -> Self {
        let defaults = Self::default();
        let Some(section) = ini.section(Some(SECTION)) else {
            tracing::warn!("missing [{SECTION}] section, using defaults");
            return defaults;
        };

        Self {
            refresh_interval: parse(section, "RefreshInterval").unwrap_or(defaults.refresh_interval),
            disk_path: section
                .get("DiskPath")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.disk_path),
            enable_cpu: flag(section, "EnableCPU").unwrap_or(defaults.enable_cpu),
            enable_memory: flag(section, "EnableMemory").unwrap_or(defaults.enable_memory),
            enable_disk: flag(section, "EnableDisk").unwrap_or(defaults.enable_disk),
            enable_network: flag(section, "EnableNetwork").unwrap_or(defaults.enable_network),
            process_interval: parse(section, "ProcessInterval").unwrap_or(defaults.process_interval),
            health_interval: parse(section, "HealthInterval").unwrap_or(defaults.health_interval),
            top_processes: parse(section, "TopProcesses").unwrap_or(defaults.top_processes),
        }
        .normalized()
    }

    /// Bring every field back inside its invariant.
    pub fn normalized(mut self) -> Self {
        self.refresh_interval = clamp_refresh_interval(self.refresh_interval);

        if !self.disk_path.is_absolute() {
            self.disk_path = crate::monitor::normalize_volume_path(&self.disk_path.to_string_lossy());
        }

        if !self.any_enabled() {
            tracing::warn!("all metrics disabled, enabling all");
            self.enable_cpu = true;
            self.enable_memory = true;
            self.enable_disk = true;
            self.enable_network = true;
        }

        self.process_interval = self.process_interval.max(1);
        self.health_interval = self.health_interval.max(1);
        self
    }

    pub fn any_enabled(&self) -> bool {
        self.enable_cpu || self.enable_memory || self.enable_disk || self.enable_network
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs_f64(clamp_refresh_interval(self.refresh_interval))
    }

    pub fn process_period(&self) -> Duration {
        Duration::from_secs(self.process_interval.max(1))
    }

    pub fn health_period(&self) -> Duration {
        Duration::from_secs(self.health_interval.max(1))
    }
}

fn parse<T: std::str::FromStr>(section: &Properties, key: &str) -> Option<T> {
    let value = section.get(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "malformed setting, using default");
            None
        }
    }
}

/// `0`/`1` as written by the settings UI; `true`/`false` also accepted.
fn flag(section: &Properties, key: &str) -> Option<bool> {
    let value = section.get(key)?.trim();
    if value.eq_ignore_ascii_case("true") {
        return Some(true);
    }
    if value.eq_ignore_ascii_case("false") {
        return Some(false);
    }
    parse::<i32>(section, key).map(|v| v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn load_str(contents: &str) -> Settings {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");
        fs::write(&path, contents).unwrap();
        Settings::load(&path).unwrap()
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.ini")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn full_file() {
        let settings = load_str(
            "[monitor]\n\
             RefreshInterval = 3.5\n\
             DiskPath = /home\n\
             EnableCPU = 1\n\
             EnableMemory = 0\n\
             EnableDisk = true\n\
             EnableNetwork = false\n\
             ProcessInterval = 10\n\
             HealthInterval = 300\n\
             TopProcesses = 8\n",
        );
        assert_eq!(settings.refresh_interval, 3.5);
        assert_eq!(settings.disk_path, PathBuf::from("/home"));
        assert!(settings.enable_cpu);
        assert!(!settings.enable_memory);
        assert!(settings.enable_disk);
        assert!(!settings.enable_network);
        assert_eq!(settings.process_period(), Duration::from_secs(10));
        assert_eq!(settings.health_period(), Duration::from_secs(300));
        assert_eq!(settings.top_processes, 8);
    }

    #[test]
    fn interval_is_clamped() {
        assert_eq!(load_str("[monitor]\nRefreshInterval = 0.2\n").refresh_interval, 1.0);
        assert_eq!(load_str("[monitor]\nRefreshInterval = 60\n").refresh_interval, 5.0);
        assert_eq!(
            load_str("[monitor]\nRefreshInterval = fast\n").refresh_interval,
            DEFAULT_REFRESH_INTERVAL
        );
        assert_eq!(clamp_refresh_interval(f64::NAN), DEFAULT_REFRESH_INTERVAL);
    }

    #[test]
    fn relative_disk_path_is_rooted() {
        let settings = load_str("[monitor]\nDiskPath = Volumes/Backup\n");
        assert_eq!(settings.disk_path, PathBuf::from("/Volumes/Backup"));
    }

    #[test]
    fn all_disabled_enables_all() {
        let settings = load_str(
            "[monitor]\nEnableCPU = 0\nEnableMemory = 0\nEnableDisk = 0\nEnableNetwork = 0\n",
        );
        assert!(settings.enable_cpu && settings.enable_memory);
        assert!(settings.enable_disk && settings.enable_network);
    }

    #[test]
    fn missing_section_gives_defaults() {
        assert_eq!(load_str("[other]\nKey = 1\n"), Settings::default());
    }

    #[test]
    fn zero_cadences_are_raised() {
        let settings = load_str("[monitor]\nProcessInterval = 0\nHealthInterval = 0\n");
        assert_eq!(settings.process_period(), Duration::from_secs(1));
        assert_eq!(settings.health_period(), Duration::from_secs(1));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");
        fs::write(&path, "[monitor\nRefreshInterval = 2\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(SettingsError::Parse(_))));
    }
}
