use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Engine command-flow metrics
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub commands_accepted: AtomicU64,
    pub commands_rejected: AtomicU64,
    pub completions: AtomicU64,
    pub work_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_command_accepted(&self) {
        self.commands_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work_failure(&self) {
        self.work_failures.fetch_add(1, Ordering::Relaxed);
        warn!("acting-state work returned a failure code");
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            commands_accepted: self.commands_accepted.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            work_failures: self.work_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Engine metrics: accepted={}, rejected={}, completions={}, work_failures={}",
            stats.commands_accepted, stats.commands_rejected, stats.completions, stats.work_failures
        );
    }
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub commands_accepted: u64,
    pub commands_rejected: u64,
    pub completions: u64,
    pub work_failures: u64,
}

/// Fleet fan-out metrics
#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    pub fan_outs: AtomicU64,
    pub node_acks: AtomicU64,
    pub node_rejections: AtomicU64,
    pub unreachable_nodes: AtomicU64,
    pub status_mismatches: AtomicU64,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fan_out(&self) {
        self.fan_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_ack(&self) {
        self.node_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_rejection(&self) {
        self.node_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unreachable_node(&self) {
        self.unreachable_nodes.fetch_add(1, Ordering::Relaxed);
        warn!("subordinate node unreachable during fan-out");
    }

    pub fn record_status_mismatch(&self) {
        self.status_mismatches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Global metrics instances
static ENGINE_METRICS: std::sync::LazyLock<EngineMetrics> =
    std::sync::LazyLock::new(EngineMetrics::new);

static COORDINATION_METRICS: std::sync::LazyLock<CoordinationMetrics> =
    std::sync::LazyLock::new(CoordinationMetrics::new);

pub fn engine_metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}

pub fn coordination_metrics() -> &'static CoordinationMetrics {
    &COORDINATION_METRICS
}

/// Create correlated spans for fleet transition fan-outs
pub fn create_fan_out_span(operation: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "fan_out",
        fan_out.operation = operation,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Time an operation and record metrics
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}
