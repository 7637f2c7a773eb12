use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    Collector, CpuMetrics, CpuMonitor, DiskMetrics, DiskMonitor, MemoryMetrics, MemoryMonitor,
    NetworkMetrics, NetworkMonitor, SystemMetrics,
};
use crate::error::{CollectError, Result};
use crate::history::{HistoricalDataPoint, HistoryManager, MetricType};
use crate::settings::{clamp_refresh_interval, Settings};

/// Combined throughput that maps to a full-scale network indicator.
const NETWORK_FULL_SCALE: f64 = 10.0 * 1024.0 * 1024.0;

pub type SharedCollector<T> = Arc<Mutex<dyn Collector<Output = T>>>;

/// Bounded 0-100 indicator of combined upload and download throughput.
pub fn network_indicator(network: &NetworkMetrics) -> f64 {
    let combined = network
        .upload_bytes_per_second
        .saturating_add(network.download_bytes_per_second) as f64;
    (combined / NETWORK_FULL_SCALE * 100.0).min(100.0)
}

/// The four collectors polled every cycle.
#[derive(Clone)]
pub struct Collectors {
    pub cpu: SharedCollector<CpuMetrics>,
    pub memory: SharedCollector<MemoryMetrics>,
    pub disk: SharedCollector<DiskMetrics>,
    pub network: SharedCollector<NetworkMetrics>,
}

impl Collectors {
    /// Production collectors around an existing disk monitor, which the
    /// caller may also hand to volume event listeners.
    pub fn new(disk: Arc<Mutex<DiskMonitor>>) -> Self {
        Self {
            cpu: Arc::new(Mutex::new(CpuMonitor::new())),
            memory: Arc::new(Mutex::new(MemoryMonitor::new())),
            disk,
            network: Arc::new(Mutex::new(NetworkMonitor::new())),
        }
    }

    fn configure(&self, settings: &Settings) {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner).configure(settings);
        self.memory.lock().unwrap_or_else(PoisonError::into_inner).configure(settings);
        self.disk.lock().unwrap_or_else(PoisonError::into_inner).configure(settings);
        self.network.lock().unwrap_or_else(PoisonError::into_inner).configure(settings);
    }
}

/// Run one collector on a blocking worker.
async fn collect<T: Send + 'static>(collector: SharedCollector<T>) -> Result<T> {
    tokio::task::spawn_blocking(move || {
        let mut collector = collector.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();
        let result = collector.collect();
        tracing::trace!(
            collector = collector.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "collected"
        );
        result
    })
    .await
    .map_err(|e| CollectError::Join(e.to_string()))?
}

struct Inner {
    collectors: Collectors,
    /// Held for a whole fan-out so passes never interleave.
    cycle: tokio::sync::Mutex<()>,
    history: Arc<HistoryManager>,
    settings: Mutex<Settings>,
    snapshot: watch::Sender<Option<Arc<SystemMetrics>>>,
    monitoring: watch::Sender<bool>,
}

impl Inner {
    /// Fan out the four collections and assemble one snapshot. The first
    /// failure wins.
    async fn collect_snapshot(&self) -> Result<SystemMetrics> {
        let _cycle = self.cycle.lock().await;
        let c = &self.collectors;
        let (cpu, memory, disk, network) = tokio::try_join!(
            collect(c.cpu.clone()),
            collect(c.memory.clone()),
            collect(c.disk.clone()),
            collect(c.network.clone()),
        )?;

        Ok(SystemMetrics {
            timestamp: Instant::now(),
            cpu,
            memory,
            disk,
            network,
        })
    }

    /// Replace the published snapshot unless it is newer than `metrics`.
    fn publish(&self, metrics: Arc<SystemMetrics>) -> bool {
        self.snapshot.send_if_modified(|slot| match slot {
            Some(current) if current.timestamp > metrics.timestamp => {
                tracing::debug!("dropping stale snapshot");
                false
            }
            _ => {
                *slot = Some(metrics);
                true
            }
        })
    }

    fn record_history(&self, metrics: &SystemMetrics) {
        let settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let points = [
            (settings.enable_cpu, MetricType::Cpu, metrics.cpu.usage_percentage),
            (settings.enable_memory, MetricType::Memory, metrics.memory.usage_percentage()),
            (settings.enable_disk, MetricType::Disk, metrics.disk.usage_percentage()),
            (settings.enable_network, MetricType::Network, network_indicator(&metrics.network)),
        ];
        for (_, metric_type, value) in points.into_iter().filter(|(enabled, ..)| *enabled) {
            self.history.record(HistoricalDataPoint::new(metric_type, value));
        }
    }

    /// Publish a timer snapshot and record it unless it arrived stale.
    fn accept(&self, metrics: &Arc<SystemMetrics>) -> bool {
        if !self.publish(metrics.clone()) {
            return false;
        }
        self.record_history(metrics);
        true
    }

    async fn timer_cycle(&self) {
        match self.collect_snapshot().await {
            Ok(metrics) => {
                let metrics = Arc::new(metrics);
                if !self.accept(&metrics) {
                    return;
                }
                tracing::debug!(
                    cpu = metrics.cpu.usage_percentage,
                    memory = metrics.memory.usage_percentage(),
                    disk = metrics.disk.usage_percentage(),
                    "snapshot published"
                );
            }
            Err(e) => tracing::warn!(error = %e, "metrics collection failed"),
        }
    }

    async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            // Cancellation is only observed between cycles.
            self.timer_cycle().await;
        }
        tracing::debug!("monitoring timer stopped");
    }
}

struct Timer {
    period: Duration,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Coordinates the collectors: periodic polling, snapshot publication and
/// history recording.
pub struct SystemMonitor {
    inner: Arc<Inner>,
    timer: Mutex<Option<Timer>>,
}

impl SystemMonitor {
    pub fn new(collectors: Collectors, history: Arc<HistoryManager>, settings: Settings) -> Self {
        let settings = settings.normalized();
        collectors.configure(&settings);
        let (snapshot, _) = watch::channel(None);
        let (monitoring, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                collectors,
                cycle: tokio::sync::Mutex::new(()),
                history,
                settings: Mutex::new(settings),
                snapshot,
                monitoring,
            }),
            timer: Mutex::new(None),
        }
    }

    /// Start polling every `interval_secs` (clamped to `[1, 5]`), firing
    /// once immediately. No-op while already monitoring.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, interval_secs: f64) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let started = self.inner.monitoring.send_if_modified(|monitoring| {
            let was = *monitoring;
            *monitoring = true;
            !was
        });
        if !started {
            return;
        }

        let period = Duration::from_secs_f64(clamp_refresh_interval(interval_secs));
        tracing::info!(interval_secs = period.as_secs_f64(), "monitoring started");

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(period, shutdown.clone()));
        *timer = Some(Timer {
            period,
            shutdown,
            handle,
        });
    }

    /// Stop polling. The last snapshot stays published and an in-flight
    /// cycle still completes.
    pub fn stop(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let stopped = self.inner.monitoring.send_if_modified(|monitoring| {
            let was = *monitoring;
            *monitoring = false;
            was
        });
        if !stopped {
            return;
        }

        if let Some(timer) = timer.take() {
            timer.shutdown.cancel();
        }
        tracing::info!("monitoring stopped");
    }

    /// Collect and publish one snapshot now. Nothing is published on failure.
    pub async fn refresh(&self) -> Result<Arc<SystemMetrics>> {
        let metrics = Arc::new(self.inner.collect_snapshot().await?);
        self.inner.publish(metrics.clone());
        Ok(metrics)
    }

    /// Swap the settings used by later cycles. A changed interval restarts
    /// the timer.
    pub fn update_settings(&self, settings: Settings) {
        let settings = settings.normalized();
        self.inner.collectors.configure(&settings);

        let previous = std::mem::replace(
            &mut *self.inner.settings.lock().unwrap_or_else(PoisonError::into_inner),
            settings.clone(),
        );

        if self.is_monitoring() && previous.refresh_interval != settings.refresh_interval {
            tracing::info!(interval_secs = settings.refresh_interval, "refresh interval changed");
            self.stop();
            self.start(settings.refresh_interval);
        }
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Option<Arc<SystemMetrics>> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SystemMetrics>>> {
        self.inner.snapshot.subscribe()
    }

    /// Period of the running timer, `None` while stopped.
    pub fn timer_period(&self) -> Option<Duration> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|timer| timer.period)
    }

    pub fn is_monitoring(&self) -> bool {
        *self.inner.monitoring.borrow()
    }

    pub fn monitoring_state(&self) -> watch::Receiver<bool> {
        self.inner.monitoring.subscribe()
    }

    pub fn history(&self) -> Arc<HistoryManager> {
        self.inner.history.clone()
    }

    /// Stop the timer and wait for an in-flight cycle to finish.
    pub async fn shutdown(&self) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.inner.monitoring.send_replace(false);
        if let Some(timer) = timer {
            timer.shutdown.cancel();
            if let Err(e) = timer.handle.await {
                tracing::warn!(error = %e, "monitoring timer ended abnormally");
            }
        }
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            timer.shutdown.cancel();
        }
    }
}
