//! # evsyn Common Library
//!
//! Shared code for the evsyn services:
//! - Error type shared by infrastructure helpers
//! - TOML configuration loading and path resolution
//! - Service-wide event types (ServiceEvent) and the EventBus
//! - Server-Sent Events helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
