//! timegate core
//!
//! Seed handling and key derivation for time-gated spending policies.
//!
//! # Key Derivation
//!
//! From a single BIP-39 seed, every role gets its own hardened account:
//! - role key origin: `m/<account>'/1'/0'`
//! - signing key: `origin/0/0`
//!
//! The private material never leaves [`keys::DerivedKeyPair`] except to sign.

pub mod keys;
pub mod seed;

pub use keys::*;
pub use seed::*;
