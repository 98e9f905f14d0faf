//! Compact signed tokens.
//!
//! The format is a restricted JWT: one algorithm (ES256), a two-field header
//! `{"kid":..,"alg":"ES256"}`, unpadded base64url segments and a raw 64-byte
//! `r || s` signature. Nothing in the claims is trusted before the signature checks out;
//! only the `kid` is read early, and only to find the verification key.

pub mod es256;
pub mod jwks;

pub use es256::{Error, key_id, sign, verify};
