//! Piped and application configuration

pub mod application;
pub mod duration;
pub mod piped;
pub mod stage;

pub use application::{ApplicationConfig, GenericApplicationSpec, KindSpec};
pub use piped::{PipedConfig, PipedSpec, PlatformProvider, PlatformProviderConfig};
pub use stage::{PipelineConfig, PipelineStageConfig, SkipOptions, StageOptions};
