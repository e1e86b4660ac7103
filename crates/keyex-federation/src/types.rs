//! Federation data types: key material, signed sub-responses and server info.
//!
//! These types model the wire format of the `GetKeys` stream. Every value that
//! gets signed is also `Serialize`, and its canonical bytes come from the same
//! derive (see [`crate::signatures::canonicalize`]), so the schema field order
//! is the signed field order.

use std::fmt;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

use crate::{bounded_map::BoundedMap, error::FederationError};

// ─── Key IDs ─────────────────────────────────────────────────────────────────

/// Identifier of an Ed25519 key, formatted `ed25519:<version>`.
///
/// The version part is restricted to `[0-9A-Za-z_]`. If a different signing
/// algorithm is ever adopted, it gets a different prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(pub(crate) String);

/// The only algorithm prefix currently issued.
pub const ED25519_PREFIX: &str = "ed25519";

impl KeyId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, FederationError> {
        let raw = raw.into();
        let valid = match raw.split_once(':') {
            Some((algorithm, version)) => {
                algorithm == ED25519_PREFIX
                    && !version.is_empty()
                    && version.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if valid { Ok(Self(raw)) } else { Err(FederationError::InvalidKeyId(raw)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the algorithm prefix.
    pub fn version(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, v)| v)
    }
}

impl TryFrom<String> for KeyId {
    type Error = FederationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

impl PartialEq<str> for KeyId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Raw bytes ───────────────────────────────────────────────────────────────

/// Raw key or signature bytes.
///
/// Human-readable formats (JSON frames) carry them as unpadded base64url; the
/// canonical binary encoding carries them as a plain length-prefixed byte list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&self.0)
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base64())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(encoded.as_bytes())
                .map(Self)
                .map_err(D::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer).map(Self)
        }
    }
}

// ─── Key material ────────────────────────────────────────────────────────────

/// Who is publishing keys and until when they may be cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub server_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub valid_until_ts: DateTime<Utc>,
}

/// A current public verify key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyKey {
    /// Ed25519 public key bytes.
    pub key: Base64Bytes,
}

/// A verify key the server no longer signs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldVerifyKey {
    pub key: Base64Bytes,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expired_ts: DateTime<Utc>,
}

pub type VerifyKeys = BoundedMap<KeyId, VerifyKey>;
pub type OldVerifyKeys = BoundedMap<KeyId, OldVerifyKey>;

/// The one piece of key material a sub-response carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeysPayload {
    Metadata(KeyMetadata),
    VerifyKeys(VerifyKeys),
    OldVerifyKeys(OldVerifyKeys),
}

impl KeysPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::VerifyKeys(_) => "verify_keys",
            Self::OldVerifyKeys(_) => "old_verify_keys",
        }
    }
}

// ─── Signatures ──────────────────────────────────────────────────────────────

/// Signatures made by one server, keyed by the key ID that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub server: String,
    pub signatures: BoundedMap<KeyId, Base64Bytes>,
}

/// The signature list of a sub-response.
///
/// Like [`BoundedMap`], its length is declared before the first record is
/// attached and never grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureList {
    capacity: usize,
    records: Vec<SignatureRecord>,
}

impl SignatureList {
    pub fn new(capacity: usize) -> Result<Self, FederationError> {
        if capacity > crate::bounded_map::MAX_CAPACITY {
            return Err(FederationError::Capacity {
                requested: capacity,
                max: crate::bounded_map::MAX_CAPACITY,
            });
        }
        Ok(Self { capacity, records: Vec::with_capacity(capacity) })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn records(&self) -> &[SignatureRecord] {
        &self.records
    }

    /// Append a record after every record already attached.
    pub(crate) fn push(&mut self, record: SignatureRecord) -> Result<(), FederationError> {
        if self.records.len() >= self.capacity {
            return Err(FederationError::MapFull { capacity: self.capacity });
        }
        self.records.push(record);
        Ok(())
    }

    /// Find the signature `server` made with `key_id`.
    pub fn find(&self, server: &str, key_id: &KeyId) -> Option<&Base64Bytes> {
        self.records
            .iter()
            .filter(|r| r.server == server)
            .find_map(|r| r.signatures.get(key_id))
    }
}

impl Serialize for SignatureList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.records.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SignatureList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<SignatureRecord>::deserialize(deserializer)?;
        Ok(Self { capacity: records.len(), records })
    }
}

// ─── Signed sub-response ─────────────────────────────────────────────────────

/// One independently signed unit of the `GetKeys` stream.
///
/// The payload is only reachable through `&self`: once a response exists its
/// signatures cover exactly the payload it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSubResponse {
    payload: KeysPayload,
    signatures: SignatureList,
}

impl SignedSubResponse {
    pub(crate) fn from_parts(payload: KeysPayload, signatures: SignatureList) -> Self {
        Self { payload, signatures }
    }

    pub fn payload(&self) -> &KeysPayload {
        &self.payload
    }

    pub fn signatures(&self) -> &SignatureList {
        &self.signatures
    }
}

// ─── Server info ─────────────────────────────────────────────────────────────

/// Reply to `GetVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub name: String,
    pub version: String,
}

impl ServerVersion {
    pub fn current() -> Self {
        Self {
            name: "keyex federation key exchange".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_format() {
        assert!(KeyId::parse("ed25519:1").is_ok());
        assert!(KeyId::parse("ed25519:a_B9").is_ok());
        assert_eq!(KeyId::parse("ed25519:abc").unwrap().version(), "abc");
        assert!(KeyId::parse("ed25519:").is_err());
        assert!(KeyId::parse("ed25519").is_err());
        assert!(KeyId::parse("rsa:1").is_err());
        assert!(KeyId::parse("ed25519:a-b").is_err());
    }

    #[test]
    fn key_id_rejected_on_deserialize() {
        assert!(serde_json::from_str::<KeyId>(r#""ed25519:ok""#).is_ok());
        assert!(serde_json::from_str::<KeyId>(r#""nope""#).is_err());
    }

    #[test]
    fn bytes_are_base64_in_json() {
        let bytes = Base64Bytes(vec![0xfb, 0xff, 0x01]);
        let json = serde_json::to_string(&bytes).unwrap();
        assert_eq!(json, r#""-_8B""#);
        assert_eq!(serde_json::from_str::<Base64Bytes>(&json).unwrap(), bytes);
    }

    #[test]
    fn signature_list_is_bounded() {
        let record = SignatureRecord {
            server: "example.org".into(),
            signatures: BoundedMap::new(0).unwrap(),
        };
        let mut list = SignatureList::new(1).unwrap();
        list.push(record.clone()).unwrap();
        assert!(matches!(list.push(record), Err(FederationError::MapFull { capacity: 1 })));
        assert_eq!(list.records().len(), 1);
    }

    #[test]
    fn payload_variant_tag_on_the_wire() {
        let payload = KeysPayload::Metadata(KeyMetadata {
            server_name: "example.org".into(),
            valid_until_ts: DateTime::from_timestamp_millis(1_000).unwrap(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["metadata"]["server_name"], "example.org");
        assert_eq!(json["metadata"]["valid_until_ts"], 1_000);
    }
}
