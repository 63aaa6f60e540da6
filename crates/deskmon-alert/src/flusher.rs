use crate::error::Result;
use crate::sink::MetricSink;
use crate::stats::EngineCounters;
use deskmon_storage::MetricsStore;
use std::sync::Arc;

/// Moves buffered samples from the [`MetricSink`] into the metrics store.
///
/// Delivery is at-most-once: a regular flush that fails loses its batch.
/// A failed out-of-cycle flush hands the samples back to the sink, which
/// keeps only the newest `max_buffer_size` of them.
pub struct Flusher {
    sink: Arc<MetricSink>,
    store: Arc<dyn MetricsStore>,
    counters: Arc<EngineCounters>,
}

impl Flusher {
    pub fn new(
        sink: Arc<MetricSink>,
        store: Arc<dyn MetricsStore>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            sink,
            store,
            counters,
        }
    }

    /// Drains every source buffer and writes the samples as one batch.
    /// Returns the number of samples written.
    pub fn flush(&self) -> Result<usize> {
        let samples = self.sink.take_all();
        if samples.is_empty() {
            return Ok(0);
        }

        match self.store.batch_insert(&samples) {
            Ok(written) => {
                EngineCounters::add(&self.counters.samples_flushed, written as u64);
                tracing::debug!(count = written, "Flushed metric samples");
                Ok(written)
            }
            Err(e) => {
                EngineCounters::incr(&self.counters.flush_failures);
                EngineCounters::add(&self.counters.samples_dropped, samples.len() as u64);
                tracing::error!(
                    error = %e,
                    lost = samples.len(),
                    "Failed to flush metric samples"
                );
                Err(e.into())
            }
        }
    }

    /// Out-of-cycle flush for a single source whose buffer hit the limit.
    pub fn flush_source(&self, source_id: &str) -> Result<usize> {
        let samples = self.sink.take_source(source_id);
        if samples.is_empty() {
            return Ok(0);
        }

        match self.store.batch_insert(&samples) {
            Ok(written) => {
                EngineCounters::add(&self.counters.samples_flushed, written as u64);
                tracing::debug!(source_id, count = written, "Flushed source buffer");
                Ok(written)
            }
            Err(e) => {
                EngineCounters::incr(&self.counters.flush_failures);
                let dropped = self.sink.restore(source_id, samples);
                tracing::error!(
                    source_id,
                    error = %e,
                    dropped,
                    "Out-of-cycle flush failed"
                );
                Err(e.into())
            }
        }
    }
}
