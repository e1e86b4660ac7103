//! Ed25519 server signing keys.
//!
//! Each server holds one Ed25519 key pair that signs every sub-response of the
//! `GetKeys` stream. Receivers verify those signatures with the public key the
//! same stream publishes under `verify_keys`.
//!
//! # Key IDs
//! Key IDs follow the `ed25519:<version>` convention. Generated keys use the
//! first 6 bytes of the public key, hex-encoded, as the version.
//!
//! # Signing seam
//! The publisher signs through the [`KeySigner`] trait rather than a concrete
//! key so the signing primitive can be swapped (HSM, test doubles).

use std::fmt;

use base64::Engine as _;
use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

use crate::{error::FederationError, types::KeyId};

// ─── Signing seam ────────────────────────────────────────────────────────────

/// Anything that can produce Ed25519 signatures under a published key ID.
pub trait KeySigner: Send + Sync {
    /// Key ID the signatures are filed under.
    fn key_id(&self) -> &KeyId;

    /// Public half, published in the `verify_keys` sub-response.
    fn verifying_key(&self) -> VerifyingKey;

    /// Sign `message`, or report that the primitive refused.
    fn try_sign(&self, message: &[u8]) -> Result<Signature, SignatureError>;
}

// ─── Key pair ────────────────────────────────────────────────────────────────

/// An Ed25519 signing key pair for this server.
///
/// Constructed once at startup and shared read-only (behind `Arc`) by every
/// request task.
pub struct ServerKeyPair {
    key_id: KeyId,
    signing_key: SigningKey,
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the seed.
        f.debug_struct("ServerKeyPair").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

impl ServerKeyPair {
    /// Generate a brand-new random Ed25519 key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Self { key_id, signing_key }
    }

    /// Reconstruct a key pair from a raw 32-byte seed under the given key ID.
    pub fn from_seed(key_id: KeyId, seed: &[u8]) -> Result<Self, FederationError> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| FederationError::KeyLoad("seed must be exactly 32 bytes".into()))?;
        Ok(Self { key_id, signing_key: SigningKey::from_bytes(&bytes) })
    }

    /// File this key pair under a different key ID.
    pub fn with_key_id(mut self, key_id: KeyId) -> Self {
        self.key_id = key_id;
        self
    }

    /// Parse a key file line: `"<key_id> <base64 seed>"`.
    pub fn from_key_file(contents: &str) -> Result<Self, FederationError> {
        let (key_id, seed_b64) = contents.trim().split_once(' ').ok_or_else(|| {
            FederationError::KeyLoad(
                r#"keyfile is improperly formatted; expected "key_id seed" format"#.into(),
            )
        })?;
        let seed = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(seed_b64.trim_end_matches('='))
            .map_err(|e| FederationError::KeyLoad(format!("seed is not valid base64: {e}")))?;
        Self::from_seed(KeyId::parse(key_id)?, &seed)
    }

    /// Render the key file line that [`ServerKeyPair::from_key_file`] reads.
    pub fn to_key_file(&self) -> String {
        let seed = base64::engine::general_purpose::STANDARD_NO_PAD.encode(self.seed_bytes());
        format!("{} {}\n", self.key_id, seed)
    }

    /// Return the 32-byte seed (private key scalar) for persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Return the public key as a base64url-encoded string.
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(self.signing_key.verifying_key().as_bytes())
    }
}

impl KeySigner for ServerKeyPair {
    fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn try_sign(&self, message: &[u8]) -> Result<Signature, SignatureError> {
        self.signing_key.try_sign(message)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Derive a stable key ID from raw public key bytes.
///
/// Uses the first 6 bytes of the pubkey as a short hex fingerprint.
fn derive_key_id(pubkey_bytes: &[u8]) -> KeyId {
    let fingerprint = hex::encode(&pubkey_bytes[..6]);
    KeyId(format!("ed25519:{}", fingerprint))
}

/// Sign `message` with raw private key bytes.
///
/// Fails with [`FederationError::Signing`] if the key material is rejected
/// (anything but a 32-byte seed).
pub fn sign_with_raw_key(private_key: &[u8], message: &[u8]) -> Result<Signature, FederationError> {
    let bytes: &[u8; 32] = private_key.try_into().map_err(|_| {
        FederationError::Signing(format!(
            "Ed25519 private key must be 32 bytes, got {}",
            private_key.len()
        ))
    })?;
    SigningKey::from_bytes(bytes)
        .try_sign(message)
        .map_err(|e| FederationError::Signing(e.to_string()))
}

/// Verify an Ed25519 signature.
///
/// * `pubkey`: raw 32-byte verifying key
/// * `signature`: raw 64-byte signature
/// * `message`: original signed bytes
pub fn verify_signature(
    pubkey: &[u8],
    signature: &[u8],
    message: &[u8],
) -> Result<(), FederationError> {
    let verifying_key = VerifyingKey::from_bytes(
        pubkey.try_into().map_err(|_| FederationError::InvalidSignature)?,
    )
    .map_err(|_| FederationError::InvalidSignature)?;

    let signature = Signature::from_bytes(
        signature.try_into().map_err(|_| FederationError::InvalidSignature)?,
    );

    verifying_key.verify(message, &signature).map_err(|_| FederationError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_sign_verify() {
        let kp = ServerKeyPair::generate();
        let msg = b"hello keyex federation";
        let sig = kp.try_sign(msg).unwrap();
        verify_signature(kp.verifying_key().as_bytes(), &sig.to_bytes(), msg)
            .expect("signature should verify");
        assert!(verify_signature(kp.verifying_key().as_bytes(), &sig.to_bytes(), b"other").is_err());
    }

    #[test]
    fn debug_output_hides_the_seed() {
        let kp = ServerKeyPair::from_seed(KeyId::parse("ed25519:1").unwrap(), &[9; 32]).unwrap();
        let printed = format!("{kp:?}");
        assert!(printed.contains("ed25519:1"), "{printed}");
        let seed = base64::engine::general_purpose::STANDARD_NO_PAD.encode([9u8; 32]);
        assert!(!printed.contains(&seed));
        assert!(!printed.contains("9, 9, 9"));
    }

    #[test]
    fn generated_key_id_is_a_fingerprint() {
        let kp = ServerKeyPair::generate();
        assert!(kp.key_id().as_str().starts_with("ed25519:"));
        assert_eq!(kp.key_id().version().len(), 12);
    }

    #[test]
    fn key_file_is_stable() {
        let kp1 = ServerKeyPair::generate();
        let kp2 = ServerKeyPair::from_key_file(&kp1.to_key_file()).unwrap();
        assert_eq!(kp1.key_id(), kp2.key_id());
        assert_eq!(kp1.public_key_base64(), kp2.public_key_base64());
    }

    #[test]
    fn malformed_key_files_are_rejected() {
        assert!(matches!(ServerKeyPair::from_key_file("no-space"), Err(FederationError::KeyLoad(_))));
        assert!(matches!(
            ServerKeyPair::from_key_file("ed25519:1 AAAA"),
            Err(FederationError::KeyLoad(_))
        ));
        assert!(matches!(
            ServerKeyPair::from_key_file("bad-id AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            Err(FederationError::InvalidKeyId(_))
        ));
    }

    #[test]
    fn raw_key_of_wrong_length_is_a_signing_error() {
        assert!(matches!(sign_with_raw_key(&[0u8; 31], b"msg"), Err(FederationError::Signing(_))));
        let sig = sign_with_raw_key(&[7u8; 32], b"msg").unwrap();
        let public = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        verify_signature(public.as_bytes(), &sig.to_bytes(), b"msg").unwrap();
    }
}
