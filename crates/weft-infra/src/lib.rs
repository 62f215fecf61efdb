//! Infrastructure adapters for Weft.
//!
//! Implements the ports defined in `weft-core`:
//! - `storage` -- filesystem and in-memory `StorageBackend` implementations
//! - `secret` -- AES-256-GCM vault decrypter
//! - `provider` -- a deterministic scripted provider for tests and demos

pub mod provider;
pub mod secret;
pub mod storage;
