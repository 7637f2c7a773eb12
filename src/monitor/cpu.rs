use super::{Collector, CpuMetrics};
use crate::error::{CollectError, Result};

/// Aggregate CPU time across all cores, in kernel ticks since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
    pub nice: u64,
}

impl CpuTicks {
    pub fn total(&self) -> u64 {
        self.user
            .saturating_add(self.system)
            .saturating_add(self.idle)
            .saturating_add(self.nice)
    }

    /// Per-bucket difference, or `None` if any bucket went backwards.
    fn checked_delta(&self, previous: &CpuTicks) -> Option<CpuTicks> {
        Some(CpuTicks {
            user: self.user.checked_sub(previous.user)?,
            system: self.system.checked_sub(previous.system)?,
            idle: self.idle.checked_sub(previous.idle)?,
            nice: self.nice.checked_sub(previous.nice)?,
        })
    }
}

/// Where tick counters come from.
pub trait TickSource: Send {
    fn read_ticks(&mut self) -> Result<CpuTicks>;
}

/// Computes CPU usage from successive tick counter readings.
pub struct CpuMonitor {
    source: Box<dyn TickSource>,
    previous: Option<CpuTicks>,
}

impl CpuMonitor {
    pub fn new() -> Self {
        Self::with_source(Box::new(platform::DefaultTickSource::new()))
    }

    pub fn with_source(source: Box<dyn TickSource>) -> Self {
        Self {
            source,
            previous: None,
        }
    }

    pub fn refresh(&mut self) -> Result<CpuMetrics> {
        let ticks = self.source.read_ticks()?;
        let metrics = compute_usage(self.previous.as_ref(), &ticks);
        self.previous = Some(ticks);
        Ok(metrics)
    }
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CpuMonitor {
    type Output = CpuMetrics;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn collect(&mut self) -> Result<CpuMetrics> {
        self.refresh()
    }
}

/// Delta-over-total-delta against the previous reading; proportions of the
/// absolute counters when there is none.
fn compute_usage(previous: Option<&CpuTicks>, current: &CpuTicks) -> CpuMetrics {
    let ticks = match previous {
        Some(previous) => match current.checked_delta(previous) {
            Some(delta) => delta,
            None => {
                tracing::debug!("cpu tick counters went backwards, reporting idle");
                return CpuMetrics::idle();
            }
        },
        None => *current,
    };

    let total = ticks.total();
    if total == 0 {
        return CpuMetrics::idle();
    }

    let total = total as f64;
    let user = (ticks.user + ticks.nice) as f64 / total * 100.0;
    let system = ticks.system as f64 / total * 100.0;
    let idle = ticks.idle as f64 / total * 100.0;

    CpuMetrics::new(user, system, idle)
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// iowait counts as idle; irq, softirq and steal count as system time.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(content: &str) -> Result<CpuTicks> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| CollectError::InvalidData("no aggregate cpu line".to_string()))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| CollectError::InvalidData(format!("cpu line: {e}")))?;

    if fields.len() < 4 {
        return Err(CollectError::InvalidData(format!(
            "cpu line has {} fields",
            fields.len()
        )));
    }

    let field = |i: usize| fields.get(i).copied().unwrap_or(0);

    Ok(CpuTicks {
        user: field(0),
        nice: field(1),
        system: field(2) + field(5) + field(6) + field(7),
        idle: field(3) + field(4),
    })
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{parse_proc_stat, CpuTicks, TickSource};
    use crate::error::{CollectError, Result};
    use std::fs;

    /// Reads `/proc/stat`.
    pub struct DefaultTickSource;

    impl DefaultTickSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl TickSource for DefaultTickSource {
        fn read_ticks(&mut self) -> Result<CpuTicks> {
            let content = fs::read_to_string("/proc/stat")
                .map_err(|e| CollectError::KernelUnavailable(format!("/proc/stat: {e}")))?;
            parse_proc_stat(&content)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::{CpuTicks, TickSource};
    use crate::error::Result;
    use std::time::Instant;
    use sysinfo::System;

    /// Builds monotonic tick counters out of sysinfo's usage readings.
    ///
    /// Each read adds `usage * elapsed` to the user bucket and the rest to
    /// idle, in hundredths of a second, so deltas reproduce sysinfo's usage.
    pub struct DefaultTickSource {
        system: System,
        last_read: Instant,
        busy: f64,
        idle: f64,
    }

    impl DefaultTickSource {
        pub fn new() -> Self {
            let mut system = System::new();
            // Initial refresh to get baseline
            system.refresh_cpu_usage();
            Self {
                system,
                last_read: Instant::now(),
                busy: 0.0,
                idle: 0.0,
            }
        }
    }

    impl TickSource for DefaultTickSource {
        fn read_ticks(&mut self) -> Result<CpuTicks> {
            self.system.refresh_cpu_usage();
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_read).as_secs_f64();
            self.last_read = now;

            let usage = (self.system.global_cpu_usage() as f64).clamp(0.0, 100.0);
            self.busy += usage * elapsed;
            self.idle += (100.0 - usage) * elapsed;

            Ok(CpuTicks {
                user: self.busy as u64,
                system: 0,
                idle: self.idle as u64,
                nice: 0,
            })
        }
    }
}
