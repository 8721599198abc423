//! Integration tests for cmdty-app.
//!
//! These tests verify the interaction between components:
//! - Price stream connection lifecycle
//! - Application startup, price persistence and sync replay

pub mod common;
