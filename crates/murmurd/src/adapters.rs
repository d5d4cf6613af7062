//! External collaborator adapters
//!
//! The exchange engine and scheduler never touch a UI toolkit or a metrics
//! backend directly; they call these two traits instead. The daemon binary
//! wires in whatever concrete implementation fits its host (push
//! notifications on a phone, a metrics exporter, or just these no-op/
//! tracing defaults for a headless node).

use tracing::info;

/// Tells whatever's hosting the daemon that new messages arrived, so it can
/// surface a notification. Fire-and-forget: a failure here must never abort
/// an exchange.
pub trait Notifications: Send + Sync {
    fn show_new_messages(&self, count: usize);
}

/// Default used when nothing else is plugged in; drops the signal.
pub struct NoopNotifications;

impl Notifications for NoopNotifications {
    fn show_new_messages(&self, _count: usize) {}
}

/// Structured event sink for scheduler/exchange telemetry. Implementations
/// must not block the caller; dropping events under backpressure is
/// preferable to stalling an exchange.
pub trait Telemetry: Send + Sync {
    fn track(&self, event: &str, fields: &[(&str, &str)]);
}

/// Default telemetry: emit a structured `tracing` event. Cheap enough, and
/// non-blocking the way a channel-backed exporter would be, that no
/// daemon needs anything fancier just to get useful logs.
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track(&self, event: &str, fields: &[(&str, &str)]) {
        info!(event, ?fields, "telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_notifications_does_not_panic() {
        let n = NoopNotifications;
        n.show_new_messages(3);
    }

    #[test]
    fn tracing_telemetry_does_not_panic() {
        let t = TracingTelemetry;
        t.track("exchange_completed", &[("peer", "abc123")]);
    }
}
