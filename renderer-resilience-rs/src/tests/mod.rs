//! Cross-module tests for the supervision pipeline
//!
//! Unit tests live next to the code they cover; the modules here drive
//! several components together through the public API.

pub mod pipeline_properties;
