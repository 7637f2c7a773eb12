pub mod app;
pub mod error;
pub mod history;
pub mod monitor;
pub mod settings;
pub mod summary;

pub use app::App;
pub use error::{CollectError, SettingsError, TerminateError};
pub use history::{HistoricalDataPoint, HistoryManager, MetricType};
pub use monitor::{SystemMetrics, SystemMonitor};
pub use settings::Settings;
