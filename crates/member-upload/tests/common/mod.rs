//! Shared test utilities for member-upload integration tests.
//!
//! - `TestHarness`: a running service over a temp directory, with a scripted
//!   registry and a member store that can be told to fail
//! - Builders for upload sheets and configs

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FlakyStore, ScriptedRegistry, TestHarness};
