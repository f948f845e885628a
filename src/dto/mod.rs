use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// REST request and response bodies.
pub mod api;
/// Outbound socket commands.
pub mod commands;
/// Duel view models.
pub mod duel;
/// Inbound socket events.
pub mod events;
/// Payload and input validation.
pub mod validation;

/// Render an epoch-millisecond timestamp as RFC 3339.
pub fn format_epoch_ms(epoch_ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(epoch_ms) * 1_000_000)
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}
