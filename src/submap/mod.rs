//! Submap lifecycle: retry/revalidation state, trajectory bookkeeping,
//! and the manager orchestrating local and global stores.

pub mod manager;
pub mod retry;
pub mod trajectory;

pub use manager::{GlobalOutcome, LocalOutcome, SubmapManager};
pub use retry::RetryScan;
pub use trajectory::TrajectoryBook;
