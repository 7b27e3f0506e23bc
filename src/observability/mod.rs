//! Observability
//!
//! Structured lifecycle events for every supervisor state transition.

pub mod events;

pub use events::{EventSink, LifecycleEvent, LogSink, MemorySink};
