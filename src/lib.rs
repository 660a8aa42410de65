//! Thriftroute - cost-aware request router for LLM backends
//!
//! Routes natural-language requests to the cheapest backend that can
//! competently answer them - local runtimes first, cloud providers as
//! fallback - and fails over automatically when a backend is unavailable,
//! rate-limited, or returns low-confidence output.

pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod facade;
pub mod handlers;
pub mod probe;
pub mod registry;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod triage;
