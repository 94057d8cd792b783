//! Batch signing
//!
//! Every outgoing batch carries an `X-Signature` header: the lowercase hex
//! HMAC-SHA-256 of the exact request body, keyed with the project's API key.
//! The ingestion endpoint recomputes it to check integrity and origin. It is
//! not an encryption mechanism.
//!
//! Two primitives are available and produce identical digests:
//! - [`Signer::Ring`]: `ring::hmac`
//! - [`Signer::RustCrypto`]: the `hmac` + `sha2` crates, for targets `ring`
//!   does not build for
//!
//! [`Signer::for_target`] picks one once per build target.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// HMAC-SHA-256 implementation used to sign batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signer {
    Ring,
    RustCrypto,
}

impl Signer {
    /// Primitive suited to the current build target
    pub fn for_target() -> Self {
        if cfg!(target_arch = "wasm32") {
            Signer::RustCrypto
        } else {
            Signer::Ring
        }
    }

    /// Sign `payload` with `secret`, returning a lowercase hex digest
    pub fn sign(&self, payload: &[u8], secret: &[u8]) -> String {
        match self {
            Signer::Ring => {
                let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret);
                hex::encode(ring::hmac::sign(&key, payload).as_ref())
            }
            Signer::RustCrypto => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
                mac.update(payload);
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }
}

impl Default for Signer {
    fn default() -> Self {
        Self::for_target()
    }
}

/// Sign a request body with the target's default primitive
pub fn create_signature(payload: &str, secret: &str) -> String {
    Signer::for_target().sign(payload.as_bytes(), secret.as_bytes())
}
