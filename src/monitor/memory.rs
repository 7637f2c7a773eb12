use super::{Collector, MemoryMetrics};
use crate::error::Result;

/// Virtual memory page counts for one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmPageStats {
    pub page_size: u64,
    pub free: u64,
    pub active: u64,
    pub inactive: u64,
    pub wired: u64,
    pub compressed: u64,
}

impl VmPageStats {
    fn bytes(&self, pages: u64) -> u64 {
        pages.saturating_mul(self.page_size)
    }
}

/// Where page statistics and the physical memory size come from.
pub trait PageSource: Send {
    fn read_pages(&mut self) -> Result<VmPageStats>;

    fn physical_memory(&mut self) -> Result<u64>;
}

/// Instantaneous memory usage. Keeps no state between calls.
pub struct MemoryMonitor {
    source: Box<dyn PageSource>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::with_source(Box::new(platform::DefaultPageSource::new()))
    }

    pub fn with_source(source: Box<dyn PageSource>) -> Self {
        Self { source }
    }

    pub fn refresh(&mut self) -> Result<MemoryMetrics> {
        let pages = self.source.read_pages()?;
        let total = self.source.physical_memory()?;

        let used = pages
            .bytes(pages.active)
            .saturating_add(pages.bytes(pages.wired))
            .saturating_add(pages.bytes(pages.compressed));

        Ok(MemoryMetrics::new(
            total,
            used,
            pages.bytes(pages.free),
            pages.bytes(pages.inactive),
        ))
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemoryMonitor {
    type Output = MemoryMetrics;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn collect(&mut self) -> Result<MemoryMetrics> {
        self.refresh()
    }
}

/// Parse `/proc/meminfo` into page counts of `page_size` bytes.
///
/// Kernel-owned memory (unevictable, unreclaimable slab, kernel stacks,
/// page tables) is reported as wired. Compressed is the zswap pool as it
/// sits in RAM (`Zswap`), not the uncompressed size it stands for
/// (`Zswapped`).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str, page_size: u64) -> Result<VmPageStats> {
    use crate::error::CollectError;
    use std::collections::HashMap;

    let page_size = page_size.max(1);
    let kib: HashMap<&str, u64> = content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim(), value))
        })
        .collect();

    let pages = |keys: &[&str]| -> u64 {
        let bytes: u64 = keys
            .iter()
            .map(|k| kib.get(k).copied().unwrap_or(0).saturating_mul(1024))
            .sum();
        bytes / page_size
    };

    if !kib.contains_key("MemFree") || !kib.contains_key("Active") {
        return Err(CollectError::InvalidData(
            "meminfo lacks MemFree/Active".to_string(),
        ));
    }

    Ok(VmPageStats {
        page_size,
        free: pages(&["MemFree"]),
        active: pages(&["Active"]),
        inactive: pages(&["Inactive"]),
        wired: pages(&["Unevictable", "SUnreclaim", "KernelStack", "PageTables"]),
        compressed: pages(&["Zswap"]),
    })
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{parse_meminfo, PageSource, VmPageStats};
    use crate::error::{CollectError, Result};
    use std::fs;
    use sysinfo::System;

    pub struct DefaultPageSource {
        system: System,
        page_size: u64,
    }

    impl DefaultPageSource {
        pub fn new() -> Self {
            // SAFETY: sysconf has no preconditions.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            Self {
                system: System::new(),
                page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            }
        }
    }

    impl PageSource for DefaultPageSource {
        fn read_pages(&mut self) -> Result<VmPageStats> {
            let content = fs::read_to_string("/proc/meminfo")
                .map_err(|e| CollectError::KernelUnavailable(format!("/proc/meminfo: {e}")))?;
            parse_meminfo(&content, self.page_size)
        }

        fn physical_memory(&mut self) -> Result<u64> {
            self.system.refresh_memory();
            Ok(self.system.total_memory())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::{PageSource, VmPageStats};
    use crate::error::Result;
    use sysinfo::System;

    /// Derives page buckets from sysinfo's byte counts, one byte per page.
    pub struct DefaultPageSource {
        system: System,
    }

    impl DefaultPageSource {
        pub fn new() -> Self {
            let mut system = System::new();
            system.refresh_memory();
            Self { system }
        }
    }

    impl PageSource for DefaultPageSource {
        fn read_pages(&mut self) -> Result<VmPageStats> {
            self.system.refresh_memory();
            let free = self.system.free_memory();
            Ok(VmPageStats {
                page_size: 1,
                free,
                active: self.system.used_memory(),
                inactive: self.system.available_memory().saturating_sub(free),
                wired: 0,
                compressed: 0,
            })
        }

        fn physical_memory(&mut self) -> Result<u64> {
            Ok(self.system.total_memory())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectError;

    struct FixedPages {
        pages: Result<VmPageStats>,
        total: u64,
    }

    impl PageSource for FixedPages {
        fn read_pages(&mut self) -> Result<VmPageStats> {
            self.pages.clone()
        }

        fn physical_memory(&mut self) -> Result<u64> {
            Ok(self.total)
        }
    }

    #[test]
    fn converts_pages_to_bytes() {
        let pages = VmPageStats {
            page_size: 16_384,
            free: 10,
            active: 100,
            inactive: 50,
            wired: 20,
            compressed: 5,
        };
        let mut memory = MemoryMonitor::with_source(Box::new(FixedPages {
            pages: Ok(pages),
            total: 16_384 * 200,
        }));

        let metrics = memory.collect().unwrap();
        assert_eq!(metrics.used_bytes, 16_384 * 125);
        assert_eq!(metrics.free_bytes, 16_384 * 10);
        assert_eq!(metrics.cached_bytes, 16_384 * 50);
        assert_eq!(metrics.total_bytes, 16_384 * 200);
        assert!((metrics.usage_percentage() - 62.5).abs() < 1e-9);
    }

    #[test]
    fn zero_total_is_floored() {
        let mut memory = MemoryMonitor::with_source(Box::new(FixedPages {
            pages: Ok(VmPageStats::default()),
            total: 0,
        }));
        assert_eq!(memory.collect().unwrap().total_bytes, 1);
    }

    #[test]
    fn source_failure_propagates() {
        let mut memory = MemoryMonitor::with_source(Box::new(FixedPages {
            pages: Err(CollectError::KernelUnavailable("host_statistics64".into())),
            total: 1,
        }));
        assert!(matches!(
            memory.collect(),
            Err(CollectError::KernelUnavailable(_))
        ));
    }

    #[test]
    fn parses_meminfo() {
        let content = "MemTotal:       16318412 kB\n\
                       MemFree:         1048576 kB\n\
                       MemAvailable:    9000000 kB\n\
                       Active:          4194304 kB\n\
                       Inactive:        2097152 kB\n\
                       Unevictable:        4096 kB\n\
                       SUnreclaim:         8192 kB\n\
                       KernelStack:        4096 kB\n\
                       PageTables:            0 kB\n\
                       HugePages_Total:       0\n";
        let pages = parse_meminfo(content, 4096).unwrap();
        assert_eq!(pages.free, 262_144);
        assert_eq!(pages.active, 1_048_576);
        assert_eq!(pages.inactive, 524_288);
        assert_eq!(pages.wired, 4_096);
        assert_eq!(pages.compressed, 0);
    }

    #[test]
    fn compressed_counts_the_zswap_pool_not_its_contents() {
        let content = "MemFree: 0 kB\nActive: 0 kB\nZswap: 100 kB\nZswapped: 400 kB\n";
        let pages = parse_meminfo(content, 1024).unwrap();
        assert_eq!(pages.compressed, 100);
    }

    #[test]
    fn meminfo_without_required_keys_is_invalid() {
        assert!(matches!(
            parse_meminfo("MemTotal: 10 kB\n", 4096),
            Err(CollectError::InvalidData(_))
        ));
    }

    #[test]
    fn default_source_collects_quickly() {
        let mut memory = MemoryMonitor::new();
        let start = std::time::Instant::now();
        if let Ok(metrics) = memory.collect() {
            assert!(metrics.total_bytes > 0);
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
    }
}
