use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::history::HistoryManager;
use crate::monitor::{
    Collectors, DiskHealthMonitor, DiskMonitor, HealthStatus, MountWatcher, ProcessMonitor,
    ProcessSort, SysinfoVolumes, SystemMonitor, VolumeEvents,
};
use crate::settings::Settings;
use crate::summary;

/// How often the mount table is diffed for attach/detach events.
const MOUNT_SCAN_PERIOD: Duration = Duration::from_secs(2);

/// Main application state
pub struct App {
    settings: Settings,
    system_monitor: Arc<SystemMonitor>,
    disk_monitor: Arc<Mutex<DiskMonitor>>,
    health_monitor: Arc<Mutex<DiskHealthMonitor>>,
    process_monitor: Arc<Mutex<ProcessMonitor>>,
    volume_events: VolumeEvents,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        let settings = settings.normalized();
        let disk_monitor = Arc::new(Mutex::new(DiskMonitor::new(settings.disk_path.clone())));
        let system_monitor = SystemMonitor::new(
            Collectors::new(disk_monitor.clone()),
            Arc::new(HistoryManager::new()),
            settings.clone(),
        );

        Self {
            settings,
            system_monitor: Arc::new(system_monitor),
            disk_monitor,
            health_monitor: Arc::new(Mutex::new(DiskHealthMonitor::new())),
            process_monitor: Arc::new(Mutex::new(ProcessMonitor::new())),
            volume_events: VolumeEvents::new(),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn system_monitor(&self) -> &Arc<SystemMonitor> {
        &self.system_monitor
    }

    /// Cancelling this token ends [`App::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every monitor and its background task
    pub fn start_monitoring(&mut self) {
        if self.system_monitor.is_monitoring() {
            return;
        }

        let volumes = self
            .disk_monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list_volumes();
        for volume in &volumes {
            tracing::info!(path = %volume.path, name = %volume.name, "volume");
        }

        self.system_monitor.start(self.settings.refresh_interval);

        let watcher = MountWatcher::new(Box::new(SysinfoVolumes));
        self.tasks.push(tokio::spawn(watcher.run(
            self.volume_events.clone(),
            MOUNT_SCAN_PERIOD,
            self.shutdown.clone(),
        )));
        self.tasks
            .push(DiskMonitor::listen(self.disk_monitor.clone(), &self.volume_events));
        self.tasks.push(DiskHealthMonitor::listen(
            self.health_monitor.clone(),
            &self.volume_events,
        ));

        self.tasks.push(self.spawn_snapshot_reporter());
        self.tasks.push(self.spawn_process_loop());
        self.tasks.push(self.spawn_health_loop());
    }

    /// Change the refresh interval, restarting the poll timer
    pub fn set_refresh_rate(&mut self, seconds: f64) {
        self.settings.refresh_interval = seconds;
        self.settings = self.settings.clone().normalized();
        self.system_monitor.update_settings(self.settings.clone());
    }

    /// Run until the shutdown token is cancelled
    pub async fn run(&mut self) {
        self.start_monitoring();
        self.shutdown.cancelled().await;
        self.shutdown().await;
    }

    fn spawn_snapshot_reporter(&self) -> JoinHandle<()> {
        let mut snapshots = self.system_monitor.subscribe();
        let system_monitor = self.system_monitor.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let latest = snapshots.borrow_and_update().clone();
                        if let Some(metrics) = latest {
                            let settings = system_monitor.settings();
                            tracing::info!("{}", summary::format_metrics(&metrics, &settings));
                        }
                    }
                }
            }
        })
    }

    fn spawn_process_loop(&self) -> JoinHandle<()> {
        let process_monitor = self.process_monitor.clone();
        let limit = self.settings.top_processes;
        every(self.settings.process_period(), self.shutdown.clone(), move || {
            let process_monitor = process_monitor.clone();
            async move {
                let top = tokio::task::spawn_blocking(move || {
                    process_monitor
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .top_processes(ProcessSort::Cpu, limit)
                })
                .await;
                match top {
                    Ok(top) => {
                        for process in &top {
                            tracing::debug!("{}", summary::format_process(process));
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "process listing failed"),
                }
            }
        })
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let health_monitor = self.health_monitor.clone();
        every(self.settings.health_period(), self.shutdown.clone(), move || {
            let health_monitor = health_monitor.clone();
            async move {
                let health = tokio::task::spawn_blocking(move || {
                    health_monitor
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .all_volumes_health()
                })
                .await;
                let health = match health {
                    Ok(health) => health,
                    Err(e) => {
                        tracing::warn!(error = %e, "disk health check failed");
                        return;
                    }
                };
                for info in &health {
                    match info.status {
                        HealthStatus::Warning | HealthStatus::Critical => tracing::warn!(
                            volume = %info.volume_name,
                            device = %info.bsd_name,
                            status = ?info.status,
                            reallocated = ?info.reallocated_sector_count.value(),
                            "disk health degraded"
                        ),
                        _ => tracing::debug!(
                            volume = %info.volume_name,
                            status = ?info.status,
                            "disk health"
                        ),
                    }
                }
            }
        })
    }

    /// Clean shutdown
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.system_monitor.shutdown().await;

        for task in std::mem::take(&mut self.tasks) {
            // Volume listeners only end when the bus closes.
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "background task failed");
                }
            }
        }
        tracing::info!("shut down");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.system_monitor.stop();
    }
}

/// Run `tick` now and then every `period` until cancelled.
fn every<F, Fut>(period: Duration, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn every_runs_immediately_and_stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = {
            let count = count.clone();
            every(Duration::from_secs(60), shutdown.clone(), move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_rate_change_restarts_the_timer() {
        let settings = Settings {
            health_interval: 3_600,
            ..Settings::default()
        };
        let mut app = App::new(settings);
        app.start_monitoring();
        let system_monitor = app.system_monitor().clone();
        assert_eq!(system_monitor.timer_period(), Some(Duration::from_secs(2)));

        app.set_refresh_rate(4.0);
        assert!(system_monitor.is_monitoring());
        assert_eq!(system_monitor.timer_period(), Some(Duration::from_secs(4)));

        // Clamped to the slowest supported rate.
        app.set_refresh_rate(60.0);
        assert_eq!(app.settings.refresh_period(), Duration::from_secs(5));
        assert_eq!(system_monitor.timer_period(), Some(app.settings.refresh_period()));
        assert_eq!(system_monitor.settings().refresh_interval, 5.0);

        app.shutdown().await;
        assert_eq!(system_monitor.timer_period(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn app_runs_until_cancelled() {
        let settings = Settings {
            health_interval: 3_600,
            ..Settings::default()
        };
        let mut app = App::new(settings);
        let token = app.shutdown_token();
        let system_monitor = app.system_monitor().clone();
        let mut state = system_monitor.monitoring_state();

        let run = tokio::spawn(async move {
            app.run().await;
            app
        });

        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|monitoring| *monitoring))
            .await
            .unwrap()
            .unwrap();

        token.cancel();
        let app = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(!app.system_monitor().is_monitoring());
        assert!(app.tasks.is_empty());
    }
}
