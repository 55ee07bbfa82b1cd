//! Plain-text rendering for the chat and inbox output.

use chrono::{Local, TimeZone};
use classchat_proto::message::{DeliveryStatus, Timestamp};
use classchat_proto::thread::ThreadSummary;

use crate::connection::{ConnectionState, ConnectionStatus};
use crate::threads::MessageView;

/// Formats `ts` in the local time zone.
#[must_use]
pub fn format_timestamp(ts: Timestamp, format: &str) -> String {
    format_timestamp_in(&Local, ts, format)
}

/// Formats `ts` in `tz`; `??:??` if it is out of range.
#[must_use]
pub fn format_timestamp_in<Tz>(tz: &Tz, ts: Timestamp, format: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let ms = ts.as_millis();
    let Ok(secs) = i64::try_from(ms / 1000) else {
        return "??:??".to_string();
    };
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match tz.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format(format).to_string(),
        _ => "??:??".to_string(),
    }
}

/// Marker shown after an outgoing message.
#[must_use]
pub const fn status_symbol(status: &DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "…",
        DeliveryStatus::Sent => "✓",
        DeliveryStatus::Delivered => "✓✓",
        DeliveryStatus::Read => "✓✓ read",
        DeliveryStatus::Failed(_) => "✗ not sent",
    }
}

/// One chat line: `[12:04] Ms Dlamini: see you at 8  ✓✓`.
#[must_use]
pub fn message_line(view: &MessageView, format: &str) -> String {
    let time = format_timestamp(view.created_at, format);
    if view.outgoing {
        format!(
            "[{time}] {}: {}  {}",
            view.sender_name,
            view.body,
            status_symbol(&view.status)
        )
    } else {
        format!("[{time}] {}: {}", view.sender_name, view.body)
    }
}

/// One inbox line. Threads with unread messages are starred.
#[must_use]
pub fn summary_line(summary: &ThreadSummary, format: &str) -> String {
    let marker = if summary.has_unread() { '*' } else { ' ' };
    let time = format_timestamp(summary.updated_at, format);
    let unread = if summary.unread_count > 0 {
        format!(" ({} unread)", summary.unread_count)
    } else {
        String::new()
    };
    let last = summary
        .last_message
        .as_ref()
        .map_or_else(String::new, |m| format!("  {}: {}", m.sender_name, m.text));
    format!(
        "{marker} {time}  {}{unread}{last}  [{}]",
        summary.subject, summary.thread_id
    )
}

/// Connection banner, e.g. `disconnected, retrying in 4s`.
#[must_use]
pub fn connection_line(status: &ConnectionStatus) -> String {
    match (status.state, status.retry_in) {
        (ConnectionState::Disconnected, Some(delay)) => {
            format!("disconnected, retrying in {}s", delay.as_secs().max(1))
        }
        (ConnectionState::Reconnecting, _) => format!("reconnecting (attempt {})", status.attempt),
        (ConnectionState::Offline, _) => "offline, type /retry to reconnect".to_string(),
        (state, _) => state.to_string(),
    }
}
