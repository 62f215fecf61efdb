//! Shared domain types for Weft.
//!
//! This crate contains the core domain types used across the Weft engine:
//! the workspace graph, the Task aggregate, Generations, and Patches.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod generation;
pub mod graph;
pub mod patch;
pub mod task;
