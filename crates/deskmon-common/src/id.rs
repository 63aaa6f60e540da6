use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, MutexGuard};

static GENERATOR: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

fn generator() -> MutexGuard<'static, Option<SnowflakeIdBucket>> {
    GENERATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configures the process-wide Snowflake bucket.
///
/// `machine_id` and `node_id` must each be in `0..32`. Calling [`next_id`]
/// without `init` falls back to `(1, 1)`.
pub fn init(machine_id: i32, node_id: i32) {
    *generator() = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Returns a new Snowflake ID as a decimal string.
pub fn next_id() -> String {
    let mut guard = generator();
    guard
        .get_or_insert_with(|| SnowflakeIdBucket::new(1, 1))
        .get_id()
        .to_string()
}
