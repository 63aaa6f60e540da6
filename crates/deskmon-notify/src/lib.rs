//! Alert notification delivery.
//!
//! A rule's notify actions name one or more channel targets (email, SMS,
//! webhook). The [`dispatcher::NotificationDispatcher`] fans an alert out to
//! the [`NotificationChannel`] registered for each target's kind and
//! isolates every delivery failure from the others.

pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
mod utils;


use async_trait::async_trait;
use deskmon_common::types::{Alert, ChannelConfig, ChannelKind};

/// A delivery transport for one kind of channel.
///
/// The transport holds connection settings (SMTP relay, SMS gateway, HTTP
/// client); the per-rule [`ChannelConfig`] supplies the recipients.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// The channel kind this transport serves.
    fn kind(&self) -> ChannelKind;

    /// Delivers the alert to the recipients named in `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is for a different channel kind or if
    /// delivery still fails after the configured attempts.
    async fn send(&self, alert: &Alert, target: &ChannelConfig) -> error::Result<()>;
}
