//! Metrics sink injected into storage backends
//!
//! Backends receive a [`SharedMetrics`] at construction and report through
//! it; nothing is registered globally by this crate. [`RecorderMetrics`]
//! forwards to whatever recorder the host installed for the `metrics` facade.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receiver for backend operational events
pub trait StoreMetrics: Send + Sync + std::fmt::Debug {
    /// Store finished `initialize`
    fn on_open(&self, backend: &'static str);

    /// Store finished `close`
    fn on_close(&self, backend: &'static str);

    /// One store operation completed
    fn record_operation(
        &self,
        backend: &'static str,
        operation: &'static str,
        elapsed: Duration,
        ok: bool,
    );

    /// A tenant partition was evicted from a bounded cache
    fn record_eviction(&self, backend: &'static str, tenant_id: &str);

    /// A tenant partition (graph, file, schema) was created or opened
    fn record_partition_opened(&self, backend: &'static str, tenant_id: &str);
}

pub type SharedMetrics = Arc<dyn StoreMetrics>;

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl NoopMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(Self)
    }
}

impl StoreMetrics for NoopMetrics {
    fn on_open(&self, _backend: &'static str) {}

    fn on_close(&self, _backend: &'static str) {}

    fn record_operation(
        &self,
        _backend: &'static str,
        _operation: &'static str,
        _elapsed: Duration,
        _ok: bool,
    ) {
    }

    fn record_eviction(&self, _backend: &'static str, _tenant_id: &str) {}

    fn record_partition_opened(&self, _backend: &'static str, _tenant_id: &str) {}
}

/// Reports through the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl RecorderMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(Self)
    }
}

impl StoreMetrics for RecorderMetrics {
    fn on_open(&self, backend: &'static str) {
        metrics::gauge!("strata_store_open", "backend" => backend).increment(1.0);
    }

    fn on_close(&self, backend: &'static str) {
        metrics::gauge!("strata_store_open", "backend" => backend).decrement(1.0);
    }

    fn record_operation(
        &self,
        backend: &'static str,
        operation: &'static str,
        elapsed: Duration,
        ok: bool,
    ) {
        let status = if ok { "success" } else { "error" };
        metrics::counter!(
            "strata_operations_total",
            "backend" => backend,
            "operation" => operation,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(
            "strata_operation_duration_seconds",
            "backend" => backend,
            "operation" => operation
        )
        .record(elapsed.as_secs_f64());
    }

    // Tenant ids stay out of labels to keep cardinality bounded
    fn record_eviction(&self, backend: &'static str, _tenant_id: &str) {
        metrics::counter!("strata_tenant_evictions_total", "backend" => backend).increment(1);
    }

    fn record_partition_opened(&self, backend: &'static str, _tenant_id: &str) {
        metrics::counter!("strata_partitions_opened_total", "backend" => backend).increment(1);
    }
}

/// Times one operation and reports it when finished
pub(crate) struct OperationTimer<'a> {
    metrics: &'a dyn StoreMetrics,
    backend: &'static str,
    operation: &'static str,
    started: Instant,
}

impl<'a> OperationTimer<'a> {
    pub(crate) fn start(
        metrics: &'a dyn StoreMetrics,
        backend: &'static str,
        operation: &'static str,
    ) -> Self {
        Self {
            metrics,
            backend,
            operation,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E> {
        self.metrics
            .record_operation(self.backend, self.operation, self.started.elapsed(), result.is_ok());
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records events for assertions
    #[derive(Debug, Default)]
    pub struct RecordingMetrics {
        pub evictions: Mutex<Vec<String>>,
        pub partitions: Mutex<Vec<String>>,
        pub operations: Mutex<Vec<(&'static str, bool)>>,
    }

    impl StoreMetrics for RecordingMetrics {
        fn on_open(&self, _backend: &'static str) {}

        fn on_close(&self, _backend: &'static str) {}

        fn record_operation(
            &self,
            _backend: &'static str,
            operation: &'static str,
            _elapsed: Duration,
            ok: bool,
        ) {
            self.operations.lock().unwrap().push((operation, ok));
        }

        fn record_eviction(&self, _backend: &'static str, tenant_id: &str) {
            self.evictions.lock().unwrap().push(tenant_id.to_string());
        }

        fn record_partition_opened(&self, _backend: &'static str, tenant_id: &str) {
            self.partitions.lock().unwrap().push(tenant_id.to_string());
        }
    }
}
