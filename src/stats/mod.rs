//! Session statistics

pub mod io;
pub mod metrics;

pub use io::CountingStream;
pub use metrics::{ConnStat, SessionStat, StatDirection, StatSession};
