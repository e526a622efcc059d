//! Common utilities for usbstage
//!
//! This crate provides functionality shared across the engine: error
//! handling, logging setup, and the glob-style pattern matching used by
//! device-list watchers and removal-path matching.

pub mod error;
pub mod logging;
pub mod pattern;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use pattern::glob_match;
