//! One-way operator notifications.
//!
//! The core only knows a single `notify(text)` interface. Delivery is
//! fire-and-forget: implementations must never block the tick loop and
//! must drop failures after logging them. The Telegram implementation
//! lives in its own crate; the core ships a no-op.

/// A fire-and-forget notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str);
}

/// Discards everything. Used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, text: &str) {
        tracing::debug!(text, "notification dropped (no transport configured)");
    }
}

// ── message templates ──

pub fn format_stalled(window: &str, attempts: u64) -> String {
    format!("⚠️ autopilot | {window}\n\nstalled: {attempts} nudges without acknowledgement")
}

pub fn format_compact_failed(window: &str, failures: u64) -> String {
    format!("⚠️ autopilot | {window}\n\ncompaction failed {failures} times in a row")
}

pub fn format_working_stall(window: &str, minutes: u64) -> String {
    format!("⚠️ autopilot | {window}\n\nworking for {minutes} min with no commit or context change")
}

pub fn format_manual_block(window: &str, reason: &str) -> String {
    format!("✋ autopilot | {window}\n\nmanual step required: {reason}")
}

pub fn format_low_context_critical(window: &str, pct: i64) -> String {
    format!("⚠️ autopilot | {window}\n\ncontext critically low: {pct}%")
}

pub fn format_new_todo_items(window: &str, count: usize) -> String {
    format!("📝 autopilot | {window}\n\nTODO list changed ({count} items open), nudge backoff reset")
}
