//! Planning: what a run has to do to bring the destination up to date.

pub mod diff;
pub mod plan;

pub use diff::{build_plan, should_skip};
pub use plan::{Plan, TransferAction, TransferItem};
