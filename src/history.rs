//! Short in-memory history of the published metrics, for sparklines.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Fixed-capacity ring that overwrites its oldest entry when full.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    /// Next slot to write.
    cursor: usize,
    count: usize,
}

impl<T: Clone> CircularBuffer<T> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            cursor: 0,
            count: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        let capacity = self.slots.len();
        self.slots[self.cursor] = Some(value);
        self.cursor = (self.cursor + 1) % capacity;
        self.count = (self.count + 1).min(capacity);
    }

    /// Live entries, oldest first.
    pub fn to_ordered_vec(&self) -> Vec<T> {
        let capacity = self.slots.len();
        let start = (self.cursor + capacity - self.count) % capacity;
        (0..self.count)
            .filter_map(|i| self.slots[(start + i) % capacity].clone())
            .collect()
    }

    pub fn latest(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.slots.len();
        self.slots[(self.cursor + capacity - 1) % capacity].as_ref()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.cursor = 0;
        self.count = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl MetricType {
    pub const ALL: [MetricType; 4] = [
        MetricType::Cpu,
        MetricType::Memory,
        MetricType::Disk,
        MetricType::Network,
    ];

    fn index(self) -> usize {
        match self {
            MetricType::Cpu => 0,
            MetricType::Memory => 1,
            MetricType::Disk => 2,
            MetricType::Network => 3,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricType::Cpu => "cpu",
            MetricType::Memory => "memory",
            MetricType::Disk => "disk",
            MetricType::Network => "network",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalDataPoint {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub metric_type: MetricType,
    /// Percentage-equivalent value, never negative.
    pub value: f64,
}

impl HistoricalDataPoint {
    pub fn new(metric_type: MetricType, value: f64) -> Self {
        Self::with_timestamp(metric_type, value, Utc::now())
    }

    /// Timestamps in the future are pulled back to now.
    pub fn with_timestamp(metric_type: MetricType, value: f64, timestamp: DateTime<Utc>) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.max(0.0) };
        Self {
            id: Uuid::new_v4(),
            timestamp: timestamp.min(Utc::now()),
            metric_type,
            value,
        }
    }
}

/// One [`CircularBuffer`] per [`MetricType`] behind a single lock.
#[derive(Debug)]
pub struct HistoryManager {
    buffers: Mutex<[CircularBuffer<HistoricalDataPoint>; 4]>,
}

impl HistoryManager {
    pub const DEFAULT_CAPACITY: usize = 60;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(std::array::from_fn(|_| CircularBuffer::new(capacity))),
        }
    }

    pub fn record(&self, point: HistoricalDataPoint) {
        tracing::trace!(metric = %point.metric_type, value = point.value, "recording history point");
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers[point.metric_type.index()].push(point);
    }

    /// Points recorded within the last `duration`, oldest first.
    pub fn query(&self, metric_type: MetricType, duration: Duration) -> Vec<HistoricalDataPoint> {
        self.query_at(metric_type, duration, Utc::now())
    }

    pub fn query_at(
        &self,
        metric_type: MetricType,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Vec<HistoricalDataPoint> {
        let cutoff = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));

        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers[metric_type.index()]
            .to_ordered_vec()
            .into_iter()
            .filter(|point| cutoff.map_or(true, |cutoff| point.timestamp >= cutoff))
            .collect()
    }

    pub fn latest(&self, metric_type: MetricType) -> Option<HistoricalDataPoint> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers[metric_type.index()].latest().cloned()
    }

    pub fn len(&self, metric_type: MetricType) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers[metric_type.index()].len()
    }

    pub fn clear(&self) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.iter_mut().for_each(CircularBuffer::clear);
        tracing::debug!("history cleared");
    }

    pub fn clear_metric(&self, metric_type: MetricType) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers[metric_type.index()].clear();
    }
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new()
    }
}
