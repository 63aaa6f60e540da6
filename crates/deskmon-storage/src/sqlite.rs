use crate::error::{Result, StorageError};
use crate::{AggregateQuery, AlertFilter, AlertStore, MetricsStore};
use chrono::{DateTime, Utc};
use deskmon_common::types::{Aggregation, Alert, AlertLevel, MetricSample, Metadata};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metric_samples (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    sample_type TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_samples_type_time
    ON metric_samples(sample_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_samples_time
    ON metric_samples(timestamp);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    owner_id TEXT,
    source_execution_id TEXT,
    level TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    value REAL NOT NULL,
    threshold REAL NOT NULL,
    triggered_at INTEGER NOT NULL,
    acknowledged_at INTEGER,
    acknowledged_by TEXT,
    resolved_at INTEGER,
    resolved_by TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_alerts_triggered ON alerts(triggered_at);
CREATE INDEX IF NOT EXISTS idx_alerts_resolved ON alerts(resolved_at);
CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts(rule_id);
";

/// Columns added after the first schema, applied to older databases.
const ADDED_ALERT_COLUMNS: &[(&str, &str)] = &[("owner_id", "TEXT")];

const ALERT_COLUMNS: &str = "id, rule_id, rule_name, owner_id, source_execution_id, level, title, \
     message, value, threshold, triggered_at, acknowledged_at, acknowledged_by, resolved_at, resolved_by, metadata";

/// SQLite-backed [`MetricsStore`] and [`AlertStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        tracing::info!(path = %path.display(), "Opened monitoring database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        add_missing_alert_columns(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn add_missing_alert_columns(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(alerts)")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (name, ty) in ADDED_ALERT_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            conn.execute_batch(&format!("ALTER TABLE alerts ADD COLUMN {name} {ty};"))?;
            tracing::info!(column = name, "Added alerts column");
        }
    }
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_alerts_owner ON alerts(owner_id);")?;
    Ok(())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64, column: &'static str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StorageError::Corrupt {
        column,
        detail: format!("timestamp out of range: {ms}"),
    })
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn aggregate_fn(aggregation: Aggregation) -> &'static str {
    match aggregation {
        Aggregation::Count => "COUNT",
        Aggregation::Avg => "AVG",
        Aggregation::Sum => "SUM",
        Aggregation::Max => "MAX",
        Aggregation::Min => "MIN",
    }
}

impl MetricsStore for SqliteStore {
    fn batch_insert(&self, samples: &[MetricSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO metric_samples (id, source_id, sample_type, value, unit, timestamp, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for sample in samples {
                let metadata = serde_json::to_string(&sample.metadata)?;
                stmt.execute(rusqlite::params![
                    &sample.id,
                    &sample.source_id,
                    &sample.sample_type,
                    sample.value,
                    &sample.unit,
                    to_millis(sample.timestamp),
                    metadata,
                ])?;
            }
        }
        tx.commit()?;
        Ok(samples.len())
    }

    fn aggregate(&self, query: &AggregateQuery) -> Result<Option<f64>> {
        if query.sample_types.is_empty() {
            return Ok(None);
        }

        let mut params: Vec<Box<dyn ToSql>> = vec![
            Box::new(to_millis(query.from)),
            Box::new(to_millis(query.to)),
        ];
        let value_expr = match &query.field {
            Some(field) => {
                params.push(Box::new(format!("$.{field}")));
                format!("CAST(json_extract(metadata, ?{}) AS REAL)", params.len())
            }
            None => "value".to_string(),
        };
        let types_sql = placeholders(params.len() + 1, query.sample_types.len());
        for sample_type in &query.sample_types {
            params.push(Box::new(sample_type.clone()));
        }

        let sql = format!(
            "SELECT COUNT({value_expr}), {agg}({value_expr}) FROM metric_samples
             WHERE timestamp >= ?1 AND timestamp <= ?2 AND sample_type IN ({types_sql})",
            agg = aggregate_fn(query.aggregation),
        );

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let (count, aggregated): (i64, Option<f64>) = stmt.query_row(param_refs.as_slice(), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;

        if count == 0 {
            return Ok(None);
        }
        match query.aggregation {
            Aggregation::Count => Ok(Some(count as f64)),
            _ => Ok(aggregated),
        }
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM metric_samples WHERE timestamp < ?1",
            rusqlite::params![to_millis(cutoff)],
        )?;
        Ok(removed as u64)
    }
}

/// Translates an [`AlertFilter`] into a `WHERE` clause and its parameters.
fn alert_where(filter: &AlertFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(rule_ids) = &filter.rule_ids {
        if rule_ids.is_empty() {
            clauses.push("0".to_string());
        } else {
            clauses.push(format!(
                "rule_id IN ({})",
                placeholders(params.len() + 1, rule_ids.len())
            ));
            for id in rule_ids {
                params.push(Box::new(id.clone()));
            }
        }
    }
    if let Some(owner) = &filter.owner_id {
        params.push(Box::new(owner.clone()));
        clauses.push(format!("owner_id = ?{}", params.len()));
    }
    if let Some(level) = filter.level {
        params.push(Box::new(level.to_string()));
        clauses.push(format!("level = ?{}", params.len()));
    }
    if filter.unresolved_only {
        clauses.push("resolved_at IS NULL".to_string());
    }
    if let Some(from) = filter.triggered_from {
        params.push(Box::new(to_millis(from)));
        clauses.push(format!("triggered_at >= ?{}", params.len()));
    }
    if let Some(to) = filter.triggered_to {
        params.push(Box::new(to_millis(to)));
        clauses.push(format!("triggered_at <= ?{}", params.len()));
    }
    if let Some(before) = filter.resolved_before {
        params.push(Box::new(to_millis(before)));
        clauses.push(format!(
            "resolved_at IS NOT NULL AND resolved_at < ?{}",
            params.len()
        ));
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (sql, params)
}

struct AlertRecord {
    id: String,
    rule_id: String,
    rule_name: String,
    owner_id: Option<String>,
    source_execution_id: Option<String>,
    level: String,
    title: String,
    message: String,
    value: f64,
    threshold: f64,
    triggered_at: i64,
    acknowledged_at: Option<i64>,
    acknowledged_by: Option<String>,
    resolved_at: Option<i64>,
    resolved_by: Option<String>,
    metadata: String,
}

impl AlertRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            rule_id: row.get(1)?,
            rule_name: row.get(2)?,
            owner_id: row.get(3)?,
            source_execution_id: row.get(4)?,
            level: row.get(5)?,
            title: row.get(6)?,
            message: row.get(7)?,
            value: row.get(8)?,
            threshold: row.get(9)?,
            triggered_at: row.get(10)?,
            acknowledged_at: row.get(11)?,
            acknowledged_by: row.get(12)?,
            resolved_at: row.get(13)?,
            resolved_by: row.get(14)?,
            metadata: row.get(15)?,
        })
    }

    fn into_alert(self) -> Result<Alert> {
        let level: AlertLevel = self.level.parse().map_err(|detail| StorageError::Corrupt {
            column: "level",
            detail,
        })?;
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;
        Ok(Alert {
            id: self.id,
            rule_id: self.rule_id,
            rule_name: self.rule_name,
            owner_id: self.owner_id,
            source_execution_id: self.source_execution_id,
            level,
            title: self.title,
            message: self.message,
            value: self.value,
            threshold: self.threshold,
            triggered_at: from_millis(self.triggered_at, "triggered_at")?,
            acknowledged_at: self
                .acknowledged_at
                .map(|ms| from_millis(ms, "acknowledged_at"))
                .transpose()?,
            acknowledged_by: self.acknowledged_by,
            resolved_at: self
                .resolved_at
                .map(|ms| from_millis(ms, "resolved_at"))
                .transpose()?,
            resolved_by: self.resolved_by,
            metadata,
        })
    }
}

impl AlertStore for SqliteStore {
    fn create(&self, alert: &Alert) -> Result<()> {
        let metadata = serde_json::to_string(&alert.metadata)?;
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO alerts ({ALERT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            rusqlite::params![
                &alert.id,
                &alert.rule_id,
                &alert.rule_name,
                &alert.owner_id,
                &alert.source_execution_id,
                alert.level.to_string(),
                &alert.title,
                &alert.message,
                alert.value,
                alert.threshold,
                to_millis(alert.triggered_at),
                alert.acknowledged_at.map(to_millis),
                &alert.acknowledged_by,
                alert.resolved_at.map(to_millis),
                &alert.resolved_by,
                metadata,
            ],
        )?;
        Ok(())
    }

    fn update(&self, alert: &Alert) -> Result<bool> {
        let metadata = serde_json::to_string(&alert.metadata)?;
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE alerts SET level = ?2, title = ?3, message = ?4, acknowledged_at = ?5,
                 acknowledged_by = ?6, resolved_at = ?7, resolved_by = ?8, metadata = ?9
             WHERE id = ?1",
            rusqlite::params![
                &alert.id,
                alert.level.to_string(),
                &alert.title,
                &alert.message,
                alert.acknowledged_at.map(to_millis),
                &alert.acknowledged_by,
                alert.resolved_at.map(to_millis),
                &alert.resolved_by,
                metadata,
            ],
        )?;
        Ok(changed > 0)
    }

    fn get(&self, id: &str) -> Result<Option<Alert>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                rusqlite::params![id],
                AlertRecord::from_row,
            )
            .optional()?;
        record.map(AlertRecord::into_alert).transpose()
    }

    fn query(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let (where_sql, mut params) = alert_where(filter);
        let mut sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts{where_sql} ORDER BY triggered_at DESC, id DESC"
        );
        if let Some(limit) = filter.limit {
            params.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let records = stmt
            .query_map(param_refs.as_slice(), AlertRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.into_iter().map(AlertRecord::into_alert).collect()
    }

    fn count(&self, filter: &AlertFilter) -> Result<u64> {
        let (where_sql, params) = alert_where(filter);
        let conn = self.lock();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM alerts{where_sql}"),
            param_refs.as_slice(),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn delete_many(&self, filter: &AlertFilter) -> Result<u64> {
        if filter.is_unconstrained() {
            return Err(StorageError::UnconstrainedDelete);
        }
        let (where_sql, params) = alert_where(filter);
        let conn = self.lock();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let removed = conn.execute(
            &format!("DELETE FROM alerts{where_sql}"),
            param_refs.as_slice(),
        )?;
        Ok(removed as u64)
    }
}
