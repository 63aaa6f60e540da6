use crate::stats::EngineCounters;
use deskmon_common::types::{Metadata, MetricSample};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct SourceBuffer {
    samples: Vec<MetricSample>,
    /// An out-of-cycle flush for this source has been requested and not yet
    /// served.
    flush_requested: bool,
}

/// Thread-safe ingestion point for metric samples.
///
/// Samples are appended to a buffer per source. Appends to different
/// sources only share a read lock; appends to one source are serialised by
/// that source's mutex, so ordering within a source is preserved.
///
/// When a source's buffer grows past `max_buffer_size` the sink asks the
/// scheduler for an out-of-cycle flush of that source. Memory stays bounded
/// regardless: if nobody is listening for flush requests the buffer is
/// capped at `max_buffer_size`, otherwise at twice that, and the oldest
/// excess samples are dropped and counted.
pub struct MetricSink {
    buffers: RwLock<HashMap<String, Mutex<SourceBuffer>>>,
    max_buffer_size: AtomicUsize,
    flush_requests: Mutex<Option<mpsc::UnboundedSender<String>>>,
    counters: Arc<EngineCounters>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricSink {
    pub fn new(max_buffer_size: usize, counters: Arc<EngineCounters>) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_buffer_size: AtomicUsize::new(max_buffer_size.max(1)),
            flush_requests: Mutex::new(None),
            counters,
        }
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_max_buffer_size(&self, max: usize) {
        self.max_buffer_size.store(max.max(1), Ordering::Relaxed);
    }

    /// Routes backpressure flush requests (source IDs) to `sender`.
    pub fn attach_flush_requests(&self, sender: mpsc::UnboundedSender<String>) {
        *lock(&self.flush_requests) = Some(sender);
    }

    pub fn detach_flush_requests(&self) {
        *lock(&self.flush_requests) = None;
    }

    /// Records one observation for `source_id`. Never blocks on I/O.
    pub fn record(
        &self,
        source_id: &str,
        sample_type: &str,
        value: f64,
        unit: &str,
        metadata: Metadata,
    ) {
        self.push(MetricSample::new(source_id, sample_type, value, unit, metadata));
    }

    /// Appends an already-built sample to its source's buffer.
    pub fn push(&self, sample: MetricSample) {
        EngineCounters::incr(&self.counters.samples_recorded);
        let source_id = sample.source_id.clone();

        {
            let buffers = self
                .buffers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(buffer) = buffers.get(&source_id) {
                let mut buffer = lock(buffer);
                buffer.samples.push(sample);
                self.apply_backpressure(&source_id, &mut buffer);
                return;
            }
        }

        let mut buffers = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let buffer = buffers.entry(source_id.clone()).or_default();
        let buffer = buffer.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.samples.push(sample);
        self.apply_backpressure(&source_id, buffer);
    }

    fn apply_backpressure(&self, source_id: &str, buffer: &mut SourceBuffer) {
        let max = self.max_buffer_size();
        if buffer.samples.len() <= max {
            return;
        }

        let requested = buffer.flush_requested || self.request_flush(source_id);
        buffer.flush_requested = requested;

        let cap = if requested { max.saturating_mul(2) } else { max };
        let dropped = drop_oldest(&mut buffer.samples, cap);
        if dropped > 0 {
            EngineCounters::add(&self.counters.samples_dropped, dropped as u64);
            tracing::warn!(
                source_id,
                dropped,
                buffered = buffer.samples.len(),
                "Metric buffer full, dropped oldest samples"
            );
        }
    }

    fn request_flush(&self, source_id: &str) -> bool {
        let guard = lock(&self.flush_requests);
        match guard.as_ref() {
            Some(sender) => {
                let sent = sender.send(source_id.to_string()).is_ok();
                if sent {
                    tracing::debug!(source_id, "Out-of-cycle flush requested");
                }
                sent
            }
            None => false,
        }
    }

    /// Swaps every buffer out and returns the samples, grouped by source in
    /// recording order.
    pub fn take_all(&self) -> Vec<MetricSample> {
        let drained = {
            let mut buffers = self
                .buffers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *buffers)
        };
        drained
            .into_values()
            .flat_map(|buffer| {
                buffer
                    .into_inner()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .samples
            })
            .collect()
    }

    /// Swaps out one source's buffer.
    pub fn take_source(&self, source_id: &str) -> Vec<MetricSample> {
        let mut buffers = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffers
            .remove(source_id)
            .map(|buffer| {
                buffer
                    .into_inner()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .samples
            })
            .unwrap_or_default()
    }

    /// Puts samples from a failed out-of-cycle flush back in front of
    /// anything recorded since, keeping at most `max_buffer_size` of the
    /// newest. Returns how many were dropped.
    pub fn restore(&self, source_id: &str, mut samples: Vec<MetricSample>) -> usize {
        let max = self.max_buffer_size();
        let mut buffers = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let buffer = buffers.entry(source_id.to_string()).or_default();
        let buffer = buffer.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());

        samples.append(&mut buffer.samples);
        let dropped = drop_oldest(&mut samples, max);
        buffer.samples = samples;
        buffer.flush_requested = false;

        if dropped > 0 {
            EngineCounters::add(&self.counters.samples_dropped, dropped as u64);
        }
        dropped
    }

    /// Total samples waiting to be flushed.
    pub fn buffered(&self) -> usize {
        let buffers = self
            .buffers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffers.values().map(|b| lock(b).samples.len()).sum()
    }
}

fn drop_oldest(samples: &mut Vec<MetricSample>, cap: usize) -> usize {
    if samples.len() <= cap {
        return 0;
    }
    let excess = samples.len() - cap;
    samples.drain(..excess);
    excess
}
