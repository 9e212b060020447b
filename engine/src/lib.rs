//! Quasar engine binary crate
//!
//! The stdio protocol surface, the NDJSON event stream and the wiring
//! that assembles the runtime, market data, execution, risk and
//! strategy subsystems into one process.

pub mod app;
pub mod events;
pub mod stdio;

pub use app::App;
pub use events::{EventEmitter, EventWriter, OutEvent};
pub use stdio::{Command, parse_line};
