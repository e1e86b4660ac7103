//! File-backed server signing key management.
//!
//! On startup, `KeyManager::load_or_generate` reads the key file at the
//! configured path. If there is none (first run), it generates a fresh Ed25519
//! pair, writes it, and returns it.
//!
//! The key file holds a single line: `"<key_id> <base64 seed>"`.
//!
//! # Key rotation
//! Move the old public key into `federation.old_verify_keys`, delete the key
//! file and restart; the manager generates a new one.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use keyex_common::config::{FederationConfig, OldVerifyKeyConfig};
use tracing::{info, warn};

use crate::{
    error::FederationError,
    keys::{KeySigner, ServerKeyPair},
    publisher::{KeyRing, RetiredKey, valid_until},
    types::KeyId,
};

// ─── Key manager ─────────────────────────────────────────────────────────────

/// Handles loading or provisioning this server's Ed25519 signing key.
pub struct KeyManager {
    key_path: PathBuf,
}

impl KeyManager {
    /// Create a new `KeyManager` backed by the given key file.
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self { key_path: key_path.into() }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Return this server's `ServerKeyPair`.
    ///
    /// Steps:
    /// 1. If the key file exists, parse and return it.
    /// 2. Otherwise, generate a new pair, write it, and return it.
    pub async fn load_or_generate(&self) -> Result<Arc<ServerKeyPair>, FederationError> {
        // ── 1. Try loading from disk ──────────────────────────────────────────
        match tokio::fs::read_to_string(&self.key_path).await {
            Ok(contents) => {
                let kp = ServerKeyPair::from_key_file(&contents)?;
                info!(
                    "Federation: loaded signing key {} from {}",
                    kp.key_id(),
                    self.key_path.display()
                );
                return Ok(Arc::new(kp));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FederationError::KeyLoad(format!(
                    "failed to read {}: {e}",
                    self.key_path.display()
                )));
            }
        }

        // ── 2. Nothing found: generate + persist ───────────────────────────
        warn!("No federation signing key at {}; generating a new Ed25519 key pair", self.key_path.display());
        let kp = self.generate(None).await?;
        Ok(Arc::new(kp))
    }

    /// Generate a new key pair (optionally under `key_id`) and write it,
    /// replacing any existing key file.
    pub async fn generate(&self, key_id: Option<KeyId>) -> Result<ServerKeyPair, FederationError> {
        let mut kp = ServerKeyPair::generate();
        if let Some(key_id) = key_id {
            kp = kp.with_key_id(key_id);
        }

        if let Some(parent) = self.key_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FederationError::KeyLoad(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&self.key_path, kp.to_key_file())
            .await
            .map_err(|e| FederationError::KeyLoad(format!("failed to write {}: {e}", self.key_path.display())))?;

        info!("Federation: generated and persisted new signing key {}", kp.key_id());
        Ok(kp)
    }
}

// ─── Key ring assembly ───────────────────────────────────────────────────────

/// Decode the configured retired keys, keeping their configured order.
pub fn retired_keys(configured: &[OldVerifyKeyConfig]) -> Result<Vec<RetiredKey>, FederationError> {
    configured
        .iter()
        .map(|old| {
            let key = base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(old.public_key.trim_end_matches('='))
                .map_err(|e| {
                    FederationError::KeyLoad(format!("old key {} is not valid base64: {e}", old.key_id))
                })?;
            let expired_ts = DateTime::from_timestamp_millis(old.expired_ts).ok_or_else(|| {
                FederationError::KeyLoad(format!("old key {} has an out-of-range expiry", old.key_id))
            })?;
            Ok(RetiredKey { key_id: KeyId::parse(old.key_id.clone())?, key, expired_ts })
        })
        .collect()
}

/// Build the shared key ring from configuration and the loaded signing key.
pub fn key_ring(
    server_name: &str,
    config: &FederationConfig,
    signer: Arc<dyn KeySigner>,
) -> Result<Arc<KeyRing>, FederationError> {
    let retired = retired_keys(&config.old_verify_keys)?;
    let validity = Duration::from_secs(config.key_validity_secs);
    valid_until(Utc::now(), validity)?;
    Ok(Arc::new(
        KeyRing::new(server_name, signer, validity)
            .with_retired_keys(retired),
    ))
}
