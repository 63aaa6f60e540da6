/// Errors that can occur while delivering a notification.
///
/// # Examples
///
/// ```rust
/// use deskmon_notify::error::NotifyError;
///
/// let err = NotifyError::InvalidConfig("missing smtp host".to_string());
/// assert!(err.to_string().contains("smtp host"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Channel configuration is missing a required field or contains an invalid value.
    #[error("Notify: invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// No transport is registered for the requested channel kind.
    #[error("Notify: channel '{0}' is not configured")]
    ChannelUnavailable(String),

    /// An HTTP request to an external notification endpoint failed.
    #[error("Notify: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// SMTP transport or message construction error.
    #[error("Notify: SMTP error: {0}")]
    Smtp(String),

    /// The external endpoint returned a non-success response.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    Api {
        service: String,
        status: u16,
        body: String,
    },
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
