//! Long running loops of piped. Each one runs until its shutdown signal resolves.

pub mod controller;
pub mod drift;
pub mod planpreview;
