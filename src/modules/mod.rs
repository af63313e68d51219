//! Bundled modules

pub mod timer;
pub mod trace;

pub use timer::TimerModule;
pub use trace::{TraceModule, TraceStats};
