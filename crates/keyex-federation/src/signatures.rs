//! Canonical encoding, signing and verification of sub-responses.
//!
//! A sub-response is signed in three steps:
//!
//! ```text
//! payload ──canonicalize──► bytes ──sign──► SignatureRecord ──attach──► SignatureList
//! ```
//!
//! The canonical form is the `bincode` encoding of the payload *variant* (not
//! the enum wrapper and never the signature list): fixed-width little-endian
//! integers, length-prefixed strings and lists, fields in declaration order,
//! list entries in insertion order. Two values with equal fields always encode
//! to the same bytes.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    bounded_map::BoundedMap,
    error::FederationError,
    keys::{KeySigner, sign_with_raw_key, verify_signature},
    types::{Base64Bytes, KeyId, KeysPayload, SignatureList, SignatureRecord, SignedSubResponse},
};

// ─── Canonical form ──────────────────────────────────────────────────────────

/// Deterministic byte encoding of `message`.
pub fn canonicalize<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, FederationError> {
    Ok(bincode::serialize(message)?)
}

/// Canonical bytes of the variant a payload carries.
pub fn payload_bytes(payload: &KeysPayload) -> Result<Vec<u8>, FederationError> {
    match payload {
        KeysPayload::Metadata(metadata) => canonicalize(metadata),
        KeysPayload::VerifyKeys(keys) => canonicalize(keys),
        KeysPayload::OldVerifyKeys(keys) => canonicalize(keys),
    }
}

// ─── Signing ─────────────────────────────────────────────────────────────────

/// Sign `canonical` with `signer`, filed under `identity` and the signer's key ID.
pub fn sign<S: KeySigner + ?Sized>(
    identity: &str,
    signer: &S,
    canonical: &[u8],
) -> Result<SignatureRecord, FederationError> {
    let signature = signer
        .try_sign(canonical)
        .map_err(|e| FederationError::Signing(e.to_string()))?;
    record(identity, signer.key_id().clone(), signature.to_bytes().to_vec())
}

/// Sign `canonical` with raw private key bytes.
pub fn sign_raw(
    identity: &str,
    key_id: &KeyId,
    private_key: &[u8],
    canonical: &[u8],
) -> Result<SignatureRecord, FederationError> {
    let signature = sign_with_raw_key(private_key, canonical)?;
    record(identity, key_id.clone(), signature.to_bytes().to_vec())
}

fn record(identity: &str, key_id: KeyId, signature: Vec<u8>) -> Result<SignatureRecord, FederationError> {
    let mut signatures = BoundedMap::new(1)?;
    signatures.append(key_id, Base64Bytes(signature))?;
    Ok(SignatureRecord { server: identity.to_owned(), signatures })
}

/// Append `record` behind every record already in `into`.
pub fn attach(record: SignatureRecord, into: &mut SignatureList) -> Result<(), FederationError> {
    into.push(record)
}

/// Signs payloads on behalf of one server identity.
#[derive(Clone)]
pub struct CanonicalSigner {
    identity: String,
    signer: Arc<dyn KeySigner>,
}

impl CanonicalSigner {
    pub fn new(identity: impl Into<String>, signer: Arc<dyn KeySigner>) -> Self {
        Self { identity: identity.into(), signer }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn signer(&self) -> &dyn KeySigner {
        self.signer.as_ref()
    }

    /// Canonicalize, sign and wrap `payload` into a [`SignedSubResponse`].
    ///
    /// The payload is moved in and never handed back mutably, so the attached
    /// signature keeps matching it.
    pub fn seal(&self, payload: KeysPayload) -> Result<SignedSubResponse, FederationError> {
        let canonical = payload_bytes(&payload)?;
        let mut signatures = SignatureList::new(1)?;
        attach(sign(&self.identity, self.signer.as_ref(), &canonical)?, &mut signatures)?;
        debug!(
            "Signed {} payload ({} canonical bytes) as {} with {}",
            payload.kind(),
            canonical.len(),
            self.identity,
            self.signer.key_id()
        );
        Ok(SignedSubResponse::from_parts(payload, signatures))
    }
}

// ─── Verification ────────────────────────────────────────────────────────────

/// Check that `server` signed the payload of `response` with `key_id`.
///
/// * `pubkey`: raw 32-byte Ed25519 public key for `key_id`
pub fn verify_sub_response(
    response: &SignedSubResponse,
    server: &str,
    key_id: &KeyId,
    pubkey: &[u8],
) -> Result<(), FederationError> {
    let signature = response
        .signatures()
        .find(server, key_id)
        .ok_or(FederationError::InvalidSignature)?;
    verify_signature(pubkey, signature.as_bytes(), &payload_bytes(response.payload())?)
}
