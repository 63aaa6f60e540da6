//! Data model shared by every deskmon crate: metric samples, alert rules,
//! alerts and their severity levels.

pub mod id;
pub mod types;
