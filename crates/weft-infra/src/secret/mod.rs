//! Secret decrypter implementations.

pub mod vault;

pub use vault::VaultDecrypter;
