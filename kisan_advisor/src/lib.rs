//! Kisan advisor core library
//!
//! Routes a farmer's question, optionally with a crop photo, through a set of
//! LLM-backed specialist capabilities under one of several coordination
//! strategies.

pub mod auth;
pub mod capability;
pub mod catalog;
pub mod cli;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod query;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
pub mod telemetry;
pub mod template;
pub mod tool;
pub mod tools;

pub use capability::Capability;
pub use catalog::Catalog;
pub use coordinator::{Coordinator, Strategy};
pub use engine::ExecutionEngine;
pub use error::{OrchestrationError, OrchestrationResult};
pub use orchestrator::Orchestrator;
pub use query::{Media, Query};
pub use session::Session;
pub use settings::Settings;
