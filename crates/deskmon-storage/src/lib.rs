//! Durable storage contracts for the monitoring engine.
//!
//! The engine talks to two narrow interfaces: a [`MetricsStore`] that
//! receives flushed sample batches and answers windowed aggregate queries,
//! and an [`AlertStore`] that persists alert lifecycle changes. The bundled
//! implementation ([`sqlite::SqliteStore`]) backs both with one SQLite
//! database in WAL mode.

pub mod error;
pub mod sqlite;


use chrono::{DateTime, Utc};
use deskmon_common::types::{Aggregation, Alert, AlertLevel, MetricSample};

pub use error::{Result, StorageError};

/// A windowed aggregate over one or more sample types.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use deskmon_common::types::Aggregation;
/// use deskmon_storage::AggregateQuery;
///
/// let now = Utc::now();
/// let query = AggregateQuery::new(&["cpu_usage"], Aggregation::Max, now - Duration::minutes(5), now);
/// assert_eq!(query.sample_types, vec!["cpu_usage".to_string()]);
/// assert!(query.field.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub sample_types: Vec<String>,
    /// Numeric metadata field to aggregate instead of the sample value.
    pub field: Option<String>,
    pub aggregation: Aggregation,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl AggregateQuery {
    pub fn new(
        sample_types: &[&str],
        aggregation: Aggregation,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Self {
        Self {
            sample_types: sample_types.iter().map(|s| s.to_string()).collect(),
            field: None,
            aggregation,
            from,
            to,
        }
    }

    pub fn with_field(mut self, field: Option<String>) -> Self {
        self.field = field;
        self
    }
}

/// Persistence backend for metric samples.
///
/// Implementations are shared between the scheduler loop and the
/// administrative API, hence `Send + Sync`.
pub trait MetricsStore: Send + Sync {
    /// Writes a batch of samples atomically. Returns the number written.
    fn batch_insert(&self, samples: &[MetricSample]) -> Result<usize>;

    /// Computes the query's aggregation over its window. Returns `None` when
    /// no sample matches (including a `count` of zero).
    fn aggregate(&self, query: &AggregateQuery) -> Result<Option<f64>>;

    /// Deletes samples with a timestamp strictly before `cutoff`.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Filter for alert queries and bulk deletes. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub rule_ids: Option<Vec<String>>,
    /// Owner of the rule that raised the alert, captured at trigger time.
    pub owner_id: Option<String>,
    pub level: Option<AlertLevel>,
    pub unresolved_only: bool,
    pub triggered_from: Option<DateTime<Utc>>,
    pub triggered_to: Option<DateTime<Utc>>,
    /// Matches only resolved alerts whose `resolved_at` is before this instant.
    pub resolved_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    /// True when no field constrains the match. `limit` does not count.
    pub fn is_unconstrained(&self) -> bool {
        self.rule_ids.is_none()
            && self.owner_id.is_none()
            && self.level.is_none()
            && !self.unresolved_only
            && self.triggered_from.is_none()
            && self.triggered_to.is_none()
            && self.resolved_before.is_none()
    }
}

/// Persistence backend for alerts.
pub trait AlertStore: Send + Sync {
    fn create(&self, alert: &Alert) -> Result<()>;

    /// Overwrites the mutable fields of an existing alert. Returns false if
    /// no alert with that ID exists.
    fn update(&self, alert: &Alert) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<Alert>>;

    /// Returns matching alerts, newest trigger first.
    fn query(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;

    fn count(&self, filter: &AlertFilter) -> Result<u64>;

    /// Deletes matching alerts.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnconstrainedDelete`] for a filter that would
    /// match every alert.
    fn delete_many(&self, filter: &AlertFilter) -> Result<u64>;
}
