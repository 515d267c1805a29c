//! Plan preview
//!
//! Answers `BuildPlanPreview` commands: merges a pull request locally, finds
//! the applications the merge would trigger and tells, for each of them, how
//! it would be synced and what would change. Nothing is deployed.

mod builder;
mod diff;
mod handler;

pub use builder::{sort_results, worker_num, Builder, DEFAULT_WORKER_APP_NUM, MAX_WORKER_NUM, PLAN_PREVIEW_COMMANDER};
pub use diff::{PlanDiff, NO_CHANGES};
pub use handler::Handler;
