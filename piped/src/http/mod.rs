//! Control-plane client
//!
//! [`PipedApi`] is the surface every piped component talks to. [`HttpClient`]
//! implements it over the JSON REST API, [`InMemoryApi`] keeps everything in
//! process.

pub mod api;
pub mod client;
pub mod memory;

pub use api::{
    CommandHandledReport, DeploymentCompletedReport, DeploymentPlannedReport, PipedApi,
    StageStatusReport,
};
pub use client::HttpClient;
pub use memory::InMemoryApi;
