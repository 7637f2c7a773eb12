use std::time::Instant;

use sysinfo::Networks;

use super::{Collector, NetworkMetrics, RateTracker};
use crate::error::Result;

/// Interfaces that never carry real traffic: loopback, tunnels, 6to4,
/// AWDL, bridges, user-space tunnels and low-latency WLAN.
const VIRTUAL_INTERFACE_PREFIXES: &[&str] = &["lo", "gif", "stf", "awdl", "bridge", "utun", "llw"];

/// Cumulative byte counters of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub trait InterfaceSource: Send {
    fn interfaces(&mut self) -> Result<Vec<InterfaceCounters>>;
}

/// Interface counters from `sysinfo::Networks`.
pub struct SysinfoInterfaces {
    networks: Networks,
}

impl SysinfoInterfaces {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoInterfaces {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceSource for SysinfoInterfaces {
    fn interfaces(&mut self) -> Result<Vec<InterfaceCounters>> {
        self.networks.refresh();
        Ok(self
            .networks
            .iter()
            .map(|(name, data)| InterfaceCounters {
                name: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_received: data.total_received(),
            })
            .collect())
    }
}

pub fn is_virtual_interface(name: &str) -> bool {
    VIRTUAL_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Upload/download rates and lifetime totals over physical interfaces.
pub struct NetworkMonitor {
    source: Box<dyn InterfaceSource>,
    upload: RateTracker,
    download: RateTracker,
    last_sent: Option<u64>,
    last_received: Option<u64>,
    total_upload: u64,
    total_download: u64,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::with_source(Box::new(SysinfoInterfaces::new()))
    }

    pub fn with_source(source: Box<dyn InterfaceSource>) -> Self {
        Self {
            source,
            upload: RateTracker::new(),
            download: RateTracker::new(),
            last_sent: None,
            last_received: None,
            total_upload: 0,
            total_download: 0,
        }
    }

    pub fn refresh(&mut self) -> Result<NetworkMetrics> {
        self.refresh_at(Instant::now())
    }

    pub(crate) fn refresh_at(&mut self, now: Instant) -> Result<NetworkMetrics> {
        let (sent, received) = self
            .source
            .interfaces()?
            .iter()
            .filter(|iface| !is_virtual_interface(&iface.name))
            .fold((0u64, 0u64), |(sent, received), iface| {
                (
                    sent.saturating_add(iface.bytes_sent),
                    received.saturating_add(iface.bytes_received),
                )
            });

        let upload = self.upload.update_u64(sent, now);
        let download = self.download.update_u64(received, now);

        accumulate(&mut self.total_upload, &mut self.last_sent, sent);
        accumulate(&mut self.total_download, &mut self.last_received, received);

        Ok(NetworkMetrics {
            upload_bytes_per_second: upload,
            download_bytes_per_second: download,
            total_upload_bytes: self.total_upload,
            total_download_bytes: self.total_download,
        })
    }

    /// Start a fresh session: zero the totals and forget the baselines.
    pub fn reset_counters(&mut self) {
        self.upload.reset();
        self.download.reset();
        self.last_sent = None;
        self.last_received = None;
        self.total_upload = 0;
        self.total_download = 0;
        tracing::debug!("network counters reset");
    }
}

/// Add the growth of a cumulative counter to a running total. A counter
/// that went backwards adds nothing.
fn accumulate(total: &mut u64, last: &mut Option<u64>, current: u64) {
    if let Some(previous) = *last {
        if current >= previous {
            *total = total.saturating_add(current - previous);
        }
    }
    *last = Some(current);
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for NetworkMonitor {
    type Output = NetworkMetrics;

    fn name(&self) -> &'static str {
        "network"
    }

    fn collect(&mut self) -> Result<NetworkMetrics> {
        self.refresh()
    }
}
