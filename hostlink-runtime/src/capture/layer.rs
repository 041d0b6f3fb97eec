//! A `tracing` layer that forwards the process's own events into capture.
//!
//! The subscriber is installed before the runtime exists, so the layer holds
//! a [`CaptureSlot`] that the runtime fills in once capture is built.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use hostlink_core::log::{LogLevel, RawLogEvent};

use super::LogCapture;

/// Targets whose events would re-enter capture or the store.
const IGNORED_TARGETS: &[&str] = &["hostlink_runtime::capture", "hostlink_store", "sqlx"];

#[derive(Clone, Default)]
pub struct CaptureSlot(Arc<OnceLock<Arc<LogCapture>>>);

impl CaptureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a capture was already attached.
    pub fn attach(&self, capture: Arc<LogCapture>) -> bool {
        self.0.set(capture).is_ok()
    }

    pub fn get(&self) -> Option<&Arc<LogCapture>> {
        self.0.get()
    }
}

pub struct CaptureLayer {
    slot: CaptureSlot,
    min_level: Level,
}

impl CaptureLayer {
    pub fn new(slot: CaptureSlot) -> Self {
        Self {
            slot,
            min_level: Level::WARN,
        }
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

fn map_level(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warning,
        _ => LogLevel::Info,
    }
}

fn ignored(target: &str) -> bool {
    IGNORED_TARGETS
        .iter()
        .any(|prefix| target == *prefix || target.starts_with(&format!("{prefix}::")))
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message, self.fields.is_empty()) {
            (Some(message), true) => message,
            (Some(message), false) => format!("{message} {}", self.fields.join(" ")),
            (None, _) => self.fields.join(" "),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering in tracing runs from TRACE (greatest) to ERROR.
        if *metadata.level() > self.min_level || ignored(metadata.target()) {
            return;
        }
        let Some(capture) = self.slot.get() else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let raw = RawLogEvent::new(map_level(metadata.level()), visitor.finish())
            .with_context(metadata.target());
        capture.record(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_capture_targets_are_ignored() {
        assert!(ignored("hostlink_store"));
        assert!(ignored("hostlink_store::requests"));
        assert!(ignored("sqlx::query"));
        assert!(!ignored("hostlink_runtime::poller"));
        assert!(!ignored("hostlink_storefront"));
    }

    #[test]
    fn levels_map_to_console_levels() {
        assert_eq!(map_level(&Level::ERROR), LogLevel::Error);
        assert_eq!(map_level(&Level::WARN), LogLevel::Warning);
        assert_eq!(map_level(&Level::DEBUG), LogLevel::Info);
    }

    #[test]
    fn visitor_joins_message_and_fields() {
        let visitor = MessageVisitor {
            message: Some("request_failed".into()),
            fields: vec!["id=4".into(), "kind=build".into()],
        };
        assert_eq!(visitor.finish(), "request_failed id=4 kind=build");
    }
}
