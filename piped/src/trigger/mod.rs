//! Decides which applications a new commit should deploy

mod determiner;

pub use determiner::{touched_by_changes, Determiner};
