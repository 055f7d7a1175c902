//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the audio relay:
//! - Logging and tracing infrastructure
//! - Event bus for node and session lifecycle notifications
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the relay core depends on.
//! It establishes the logging conventions and the event broadcasting
//! mechanism that node processors and the coordinator publish through.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
