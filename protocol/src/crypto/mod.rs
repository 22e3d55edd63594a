//! # Cryptographic Primitives
//!
//! Everything security-related the gateway does flows through here:
//!
//! - **Ed25519** signatures identify gateways and make every protocol
//!   message and remote log entry non-repudiable.
//! - **SHA-256** over canonical JSON produces the message hashes chained
//!   through the SATP stages and the digests stored in remote logs.
//!
//! Thin, type-safe wrappers over audited crates. Nothing is hand-rolled.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{canonical_json, hash_object, sha256, sha256_hex};
pub use keys::{GatewayKeypair, GatewayPublicKey, GatewaySignature, KeyError};
pub use signatures::{sign, sign_object, verify, verify_object, Signable};
