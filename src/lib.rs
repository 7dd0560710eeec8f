//! SignalGate Backend Library
//!
//! Webhook authentication and signal approval gateway. Exposes the pipeline
//! components for the server binary and integration tests.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod storage;
pub mod tasks;
pub mod workflow;

pub use error::PipelineError;
pub use workflow::ApprovalWorkflow;
