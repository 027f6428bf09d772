//! Replaces lexgine's global `Log::retrieve()` singleton with an explicit
//! handle: components that need to emit diagnostics take an `EventSink`
//! instead of reaching for thread-local state.

use std::fmt;
use std::sync::Arc;

/// A sink for structured diagnostic events emitted by the task graph, the
/// sink, and the cache. The default implementation forwards to the `log`
/// facade; tests can substitute a sink that records events instead.
pub trait EventSink: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards events to the `log` crate at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn info(&self, message: &str) {
        log::info!("{}", message);
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", message);
    }

    fn error(&self, message: &str) {
        log::error!("{}", message);
    }
}

/// Shared handle to an [`EventSink`], cheap to clone and pass into worker
/// threads.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Convenience constructor for the default `log`-backed sink.
pub fn default_sink() -> SharedEventSink {
    Arc::new(LogSink)
}

impl fmt::Debug for dyn EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}
