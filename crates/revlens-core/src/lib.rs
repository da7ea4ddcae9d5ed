//! # Revlens Core
//!
//! Data model, database schema, and shared utilities for the revlens
//! statement-analysis service. This crate provides the foundation layer that
//! the services and HTTP crates depend on.

pub mod database;
pub mod error;
pub mod models;
pub mod schema;

pub mod test_utils;

// Re-export commonly used types
pub use database::{create_pool, run_migrations, DatabasePool};
pub use error::{AppError, AppResult};

// Re-export all models for convenience
pub use models::*;
