//! Conductor Core
//!
//! Core domain types, error handling, and configuration for the Conductor
//! orchestration engine. This crate has minimal dependencies and defines the
//! shared vocabulary used across all other crates.

pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod retry;
pub mod store;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
