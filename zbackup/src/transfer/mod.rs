//! Byte movement helpers: progress reporting and the copy fan-out.

pub mod progress;
pub mod tee;

pub use progress::{BarProgress, NoopProgress, Progress};
pub use tee::TeeWriter;
