// metrics.rs — In-memory MetricsCollector.
//
// Keeps a bounded window of recent samples plus running totals. Aggregation
// and reporting beyond `summary()` belong to whatever consumes the samples.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tg_policy::OperationType;

use crate::error::AuditError;
use crate::record::OperationSample;
use crate::sink::MetricsCollector;

/// Running totals since the collector was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    pub total: u64,
    pub approved: u64,
    pub escalated: u64,
    pub denied: u64,
    pub mean_processing_us: f64,
    pub max_processing_us: u64,
    pub by_type: BTreeMap<OperationType, u64>,
}

#[derive(Default)]
struct Totals {
    total: u64,
    approved: u64,
    escalated: u64,
    denied: u64,
    processing_us_sum: u128,
    max_processing_us: u64,
    by_type: BTreeMap<OperationType, u64>,
}

/// Bounded in-memory metrics sink.
pub struct MemoryMetrics {
    capacity: usize,
    recent: Mutex<VecDeque<OperationSample>>,
    totals: Mutex<Totals>,
}

impl MemoryMetrics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(VecDeque::new()),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Most recent samples, oldest first.
    pub fn recent(&self) -> Vec<OperationSample> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let t = self.totals.lock();
        MetricsSummary {
            total: t.total,
            approved: t.approved,
            escalated: t.escalated,
            denied: t.denied,
            mean_processing_us: if t.total == 0 {
                0.0
            } else {
                t.processing_us_sum as f64 / t.total as f64
            },
            max_processing_us: t.max_processing_us,
            by_type: t.by_type.clone(),
        }
    }
}

impl Default for MemoryMetrics {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MetricsCollector for MemoryMetrics {
    fn record_operation(&self, sample: &OperationSample) -> Result<(), AuditError> {
        {
            let mut t = self.totals.lock();
            t.total += 1;
            if sample.approved {
                t.approved += 1;
            } else if sample.requires_manual_approval {
                t.escalated += 1;
            } else {
                t.denied += 1;
            }
            t.processing_us_sum += sample.processing_time_us as u128;
            t.max_processing_us = t.max_processing_us.max(sample.processing_time_us);
            *t.by_type.entry(sample.operation_type).or_insert(0) += 1;
        }

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(sample.clone());
        Ok(())
    }
}
