pub mod config;
pub mod metrics;
pub mod runner;

pub use config::AppConfig;
pub use metrics::{RunReport, TimedOperation};
pub use runner::{Pipeline, PipelineError, PipelineSettings, RunMode, StatusReport};
