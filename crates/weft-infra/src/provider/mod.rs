//! Content-generation provider implementations.

pub mod scripted;

pub use scripted::ScriptedProvider;
