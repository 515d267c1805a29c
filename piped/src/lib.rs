//! piped library
//!
//! Core modules of the piped agent: planning, executing and reconciling
//! deployments of Kubernetes, Cloud Run, Lambda, Terraform and ECS applications.

pub mod app;
pub mod cache;
pub mod config;
pub mod controller;
pub mod deploysource;
pub mod diff;
pub mod driftdetector;
pub mod errors;
pub mod executor;
pub mod filematcher;
pub mod git;
pub mod http;
pub mod logs;
pub mod model;
pub mod planner;
pub mod planpreview;
pub mod platformprovider;
pub mod regexpool;
pub mod toolregistry;
pub mod trigger;
pub mod utils;
pub mod workers;
