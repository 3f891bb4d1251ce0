//! # backupx security
//!
//! Symmetric authenticated encryption of stored secrets.

pub mod secrets;

pub use secrets::{KeyMaterial, SecretCodec, decrypt, encrypt, generate, reveal, seal_config};
