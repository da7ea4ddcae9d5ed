//! # Revlens Services
//!
//! Business logic for the statement-analysis pipeline: value normalization,
//! heuristic and LLM classification, aggregation, external-service adapters,
//! and the per-session orchestrator.

pub mod services;

// Re-export commonly used services
pub use services::*;
