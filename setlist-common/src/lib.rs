//! # Setlist Common Library
//!
//! Shared code for the setlist import services:
//! - Configuration error type
//! - Configuration loading (TOML + environment)
//! - Event bus (`ImportEvent` broadcast)
//! - Server-Sent Events helpers
//! - Human-readable durations

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;
pub mod sse;

pub use error::{Error, Result};
