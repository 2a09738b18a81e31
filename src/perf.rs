// src/perf.rs
//
// =============================================================================
// RAGKEEPER: PERFORMANCE MONITOR & OPTIMIZER
// =============================================================================
//
// The ring buffer of metrics is a mutex-protected `VecDeque`, bounded
// capacity, drop-oldest-on-push, snapshot copies on read. Monitor failures
// must never fail a run, so every public method here is infallible.

use crate::document::Document;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, PartialEq)]
pub struct OperationMetric {
    pub operation: String,
    pub duration_seconds: f64,
    pub document_count: usize,
    pub docs_per_second: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

#[derive(Clone)]
pub struct PerformanceMonitor {
    metrics: Arc<Mutex<VecDeque<OperationMetric>>>,
    capacity: usize,
}

impl PerformanceMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            metrics: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Starts a scoped measurement region. Record the returned guard's
    /// `finish()` once the operation completes; dropping it without calling
    /// `finish()` records nothing, matching "monitor must never fail the run."
    pub fn start(&self, operation: impl Into<String>, document_count: usize) -> MonitorScope {
        MonitorScope {
            monitor: self.clone(),
            operation: operation.into(),
            document_count,
            started: Instant::now(),
        }
    }

    fn push(&self, metric: OperationMetric) {
        if let Ok(mut metrics) = self.metrics.lock() {
            if metrics.len() >= self.capacity {
                metrics.pop_front();
            }
            metrics.push_back(metric);
        }
    }

    /// Snapshot copy of all recorded metrics, oldest first.
    pub fn snapshot(&self) -> Vec<OperationMetric> {
        self.metrics
            .lock()
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregates recorded metrics for a single operation name.
    pub fn summary_for(&self, operation: &str) -> Option<OperationSummary> {
        let samples: Vec<OperationMetric> = self
            .snapshot()
            .into_iter()
            .filter(|m| m.operation == operation)
            .collect();
        if samples.is_empty() {
            return None;
        }
        let total_docs: usize = samples.iter().map(|s| s.document_count).sum();
        let total_duration: f64 = samples.iter().map(|s| s.duration_seconds).sum();
        let avg_docs_per_second =
            samples.iter().map(|s| s.docs_per_second).sum::<f64>() / samples.len() as f64;
        Some(OperationSummary {
            operation: operation.to_string(),
            sample_count: samples.len(),
            total_documents: total_docs,
            total_duration_seconds: total_duration,
            avg_docs_per_second,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationSummary {
    pub operation: String,
    pub sample_count: usize,
    pub total_documents: usize,
    pub total_duration_seconds: f64,
    pub avg_docs_per_second: f64,
}

/// RAII measurement scope returned by `PerformanceMonitor::start`.
pub struct MonitorScope {
    monitor: PerformanceMonitor,
    operation: String,
    document_count: usize,
    started: Instant,
}

impl MonitorScope {
    pub fn finish(self) {
        let duration = self.started.elapsed().as_secs_f64();
        let docs_per_second = if duration > 0.0 {
            self.document_count as f64 / duration
        } else {
            self.document_count as f64
        };

        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );
        system.refresh_memory();
        system.refresh_cpu_usage();
        let memory_percent = if system.total_memory() > 0 {
            100.0 * system.used_memory() as f64 / system.total_memory() as f64
        } else {
            0.0
        };
        let cpu_percent = system.global_cpu_usage() as f64;

        self.monitor.push(OperationMetric {
            operation: self.operation,
            duration_seconds: duration,
            document_count: self.document_count,
            docs_per_second,
            memory_percent,
            cpu_percent,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EfficiencyReport {
    pub underperforming_operations: Vec<String>,
    pub floor_docs_per_second: f64,
}

pub struct Optimizer {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub docs_per_second_floor: f64,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 500,
            docs_per_second_floor: 1.0,
        }
    }
}

impl Optimizer {
    /// Scales roughly linearly with available memory: one extra batch unit
    /// per 512 MB free, bounded by `[min_batch_size, max_batch_size]`.
    pub fn recommend_batch_size(&self, available_memory_gb: f64, current_batch_size: usize) -> usize {
        let scaled = (available_memory_gb * 2.0).round() as usize * 50;
        let candidate = if scaled == 0 { current_batch_size } else { scaled };
        candidate.clamp(self.min_batch_size, self.max_batch_size)
    }

    pub fn recommend_chunk_parameters(&self, documents: &[Document]) -> (usize, usize) {
        crate::chunker::adaptive_chunk_parameters(documents, 1000, 200)
    }

    pub fn analyze_efficiency(&self, history: &[OperationMetric]) -> EfficiencyReport {
        let mut underperforming: Vec<String> = history
            .iter()
            .filter(|m| m.docs_per_second < self.docs_per_second_floor)
            .map(|m| m.operation.clone())
            .collect();
        underperforming.sort();
        underperforming.dedup();
        EfficiencyReport {
            underperforming_operations: underperforming,
            floor_docs_per_second: self.docs_per_second_floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let monitor = PerformanceMonitor::new(2);
        for i in 0..5 {
            monitor.start(format!("op{i}"), 1).finish();
        }
        assert_eq!(monitor.snapshot().len(), 2);
    }

    #[test]
    fn recommend_batch_size_is_bounded() {
        let opt = Optimizer::default();
        assert_eq!(opt.recommend_batch_size(0.0, 50), opt.min_batch_size.max(50).min(opt.max_batch_size));
        assert!(opt.recommend_batch_size(1000.0, 50) <= opt.max_batch_size);
    }

    #[test]
    fn analyze_efficiency_flags_slow_operations() {
        let opt = Optimizer::default();
        let history = vec![
            OperationMetric {
                operation: "embed".into(),
                duration_seconds: 10.0,
                document_count: 1,
                docs_per_second: 0.1,
                memory_percent: 10.0,
                cpu_percent: 10.0,
            },
            OperationMetric {
                operation: "chunk".into(),
                duration_seconds: 1.0,
                document_count: 100,
                docs_per_second: 100.0,
                memory_percent: 10.0,
                cpu_percent: 10.0,
            },
        ];
        let report = opt.analyze_efficiency(&history);
        assert_eq!(report.underperforming_operations, vec!["embed".to_string()]);
    }
}
