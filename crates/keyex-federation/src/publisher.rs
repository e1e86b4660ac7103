//! The `GetKeys` publisher.
//!
//! One [`KeyPublisher`] runs per request and walks a fixed state machine:
//!
//! ```text
//! Idle ─► EmittingMetadata ─► EmittingVerifyKeys ─┬─► EmittingOldVerifyKeys ─┬─► Completed
//!                                                 └──── (no retired keys) ────┘
//! ```
//!
//! Each emitting state builds one payload, seals it (canonicalize → sign →
//! attach) and writes it to the stream. The next payload is only built after
//! the previous write was accepted. Completion is signalled after the last
//! write; any failure aborts the remaining states and no completion is sent.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    bounded_map::BoundedMap,
    error::FederationError,
    keys::KeySigner,
    signatures::CanonicalSigner,
    stream::StreamWriter,
    types::{Base64Bytes, KeyId, KeyMetadata, KeysPayload, OldVerifyKey, VerifyKey},
};

// ─── Key ring ────────────────────────────────────────────────────────────────

/// A retired verify key to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredKey {
    pub key_id: KeyId,
    pub key: Vec<u8>,
    pub expired_ts: DateTime<Utc>,
}

/// Everything a publisher needs, built once at startup and shared read-only.
pub struct KeyRing {
    signer: CanonicalSigner,
    retired: Vec<RetiredKey>,
    validity: Duration,
}

impl KeyRing {
    pub fn new(server_name: impl Into<String>, signer: Arc<dyn KeySigner>, validity: Duration) -> Self {
        Self { signer: CanonicalSigner::new(server_name, signer), retired: Vec::new(), validity }
    }

    /// Publish `retired` as old verify keys, in the order given.
    pub fn with_retired_keys(mut self, retired: Vec<RetiredKey>) -> Self {
        self.retired = retired;
        self
    }

    pub fn server_name(&self) -> &str {
        self.signer.identity()
    }

    pub fn signer(&self) -> &CanonicalSigner {
        &self.signer
    }

    pub fn retired_keys(&self) -> &[RetiredKey] {
        &self.retired
    }
}

/// `now + validity`, or [`FederationError::Validity`] if that is not a
/// representable timestamp.
pub fn valid_until(now: DateTime<Utc>, validity: Duration) -> Result<DateTime<Utc>, FederationError> {
    chrono::Duration::from_std(validity)
        .ok()
        .and_then(|validity| now.checked_add_signed(validity))
        .ok_or(FederationError::Validity(validity))
}

// ─── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    EmittingMetadata,
    EmittingVerifyKeys,
    EmittingOldVerifyKeys,
    Completed,
}

impl PublishState {
    /// The state after this one. Retired keys are skipped when there are none.
    pub fn next(self, has_retired_keys: bool) -> Self {
        match self {
            Self::Idle => Self::EmittingMetadata,
            Self::EmittingMetadata => Self::EmittingVerifyKeys,
            Self::EmittingVerifyKeys if has_retired_keys => Self::EmittingOldVerifyKeys,
            Self::EmittingVerifyKeys | Self::EmittingOldVerifyKeys | Self::Completed => {
                Self::Completed
            }
        }
    }
}

/// Publishes this server's keys to one stream.
pub struct KeyPublisher {
    ring: Arc<KeyRing>,
    state: PublishState,
}

impl KeyPublisher {
    pub fn new(ring: Arc<KeyRing>) -> Self {
        Self { ring, state: PublishState::Idle }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    /// Run the state machine to completion over `writer`.
    ///
    /// Consumes the publisher: nothing can be written after completion.
    pub async fn publish(mut self, mut writer: StreamWriter) -> Result<(), FederationError> {
        let has_retired = !self.ring.retired.is_empty();
        loop {
            let next = self.state.next(has_retired);
            if next == PublishState::Completed {
                let written = writer.written();
                if let Err(e) = writer.done().await {
                    return Err(self.abort(e));
                }
                self.state = PublishState::Completed;
                info!("Published {} key responses for {}", written, self.ring.server_name());
                return Ok(());
            }
            self.state = next;

            let payload = match self.build(next) {
                Ok(payload) => payload,
                Err(e) => return Err(self.abort(e)),
            };
            debug!("Sending server keys {} response...", payload.kind());
            let response = match self.ring.signer.seal(payload) {
                Ok(response) => response,
                Err(e) => return Err(self.abort(e)),
            };
            if let Err(e) = writer.write(response).await {
                return Err(self.abort(e));
            }
        }
    }

    fn abort(&self, error: FederationError) -> FederationError {
        warn!(
            "Aborting key stream for {} in state {:?}: {} ({})",
            self.ring.server_name(),
            self.state,
            error,
            error.error_code()
        );
        error
    }

    fn build(&self, state: PublishState) -> Result<KeysPayload, FederationError> {
        match state {
            PublishState::EmittingMetadata => self.metadata().map(KeysPayload::Metadata),
            PublishState::EmittingVerifyKeys => self.verify_keys().map(KeysPayload::VerifyKeys),
            PublishState::EmittingOldVerifyKeys => {
                self.old_verify_keys().map(KeysPayload::OldVerifyKeys)
            }
            PublishState::Idle | PublishState::Completed => Err(FederationError::Other(
                anyhow::anyhow!("state {state:?} has no payload"),
            )),
        }
    }

    fn metadata(&self) -> Result<KeyMetadata, FederationError> {
        Ok(KeyMetadata {
            server_name: self.ring.server_name().to_owned(),
            valid_until_ts: valid_until(Utc::now(), self.ring.validity)?,
        })
    }

    fn verify_keys(&self) -> Result<BoundedMap<KeyId, VerifyKey>, FederationError> {
        let signer = self.ring.signer.signer();
        let mut keys = BoundedMap::new(1)?;
        keys.append(
            signer.key_id().clone(),
            VerifyKey { key: Base64Bytes(signer.verifying_key().to_bytes().to_vec()) },
        )?;
        Ok(keys)
    }

    fn old_verify_keys(&self) -> Result<BoundedMap<KeyId, OldVerifyKey>, FederationError> {
        let mut keys = BoundedMap::new(self.ring.retired.len())?;
        keys.set_all(self.ring.retired.iter().map(|retired| {
            (
                retired.key_id.clone(),
                OldVerifyKey { key: Base64Bytes(retired.key.clone()), expired_ts: retired.expired_ts },
            )
        }))?;
        Ok(keys)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ed25519_dalek::{Signature, SignatureError, VerifyingKey};

    use super::*;
    use crate::{
        flow::FlowLimiter,
        keys::ServerKeyPair,
        signatures::verify_sub_response,
        stream::{deliver, stream_channel, tests::RecordingSink},
        types::SignedSubResponse,
    };

    /// Signs normally until `remaining` signatures have been made, then fails.
    pub(crate) struct FailingSigner {
        inner: ServerKeyPair,
        remaining: AtomicUsize,
    }

    impl FailingSigner {
        pub(crate) fn after(signatures: usize) -> Self {
            Self { inner: ServerKeyPair::generate(), remaining: AtomicUsize::new(signatures) }
        }
    }

    impl KeySigner for FailingSigner {
        fn key_id(&self) -> &KeyId {
            self.inner.key_id()
        }

        fn verifying_key(&self) -> VerifyingKey {
            self.inner.verifying_key()
        }

        fn try_sign(&self, message: &[u8]) -> Result<Signature, SignatureError> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(SignatureError::new());
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            self.inner.try_sign(message)
        }
    }

    /// Keeps a copy of every response so tests can inspect signatures.
    #[derive(Default)]
    struct CollectingSink {
        responses: Vec<SignedSubResponse>,
        completed: usize,
    }

    #[async_trait::async_trait]
    impl crate::stream::StreamSink for CollectingSink {
        async fn on_sub_response(&mut self, response: &SignedSubResponse) -> Result<(), FederationError> {
            self.responses.push(response.clone());
            Ok(())
        }

        async fn on_complete(&mut self) -> Result<(), FederationError> {
            self.completed += 1;
            Ok(())
        }
    }

    fn ring_with(signer: Arc<dyn KeySigner>) -> Arc<KeyRing> {
        Arc::new(KeyRing::new("example.org", signer, Duration::from_secs(86_400)))
    }

    #[test]
    fn state_order() {
        use PublishState::*;
        let walk = |has_retired| {
            let mut state = Idle;
            let mut seen = vec![state];
            while state != Completed {
                state = state.next(has_retired);
                seen.push(state);
            }
            seen
        };
        assert_eq!(walk(false), [Idle, EmittingMetadata, EmittingVerifyKeys, Completed]);
        assert_eq!(
            walk(true),
            [Idle, EmittingMetadata, EmittingVerifyKeys, EmittingOldVerifyKeys, Completed]
        );
        assert_eq!(Completed.next(true), Completed);
    }

    #[tokio::test]
    async fn publishes_metadata_then_verify_keys_then_completes() {
        let kp = Arc::new(ServerKeyPair::from_seed(KeyId::parse("ed25519:1").unwrap(), &[5; 32]).unwrap());
        let pubkey = kp.verifying_key().to_bytes();
        let publisher = KeyPublisher::new(ring_with(kp.clone()));
        assert_eq!(publisher.state(), PublishState::Idle);

        let (writer, receiver) = stream_channel(FlowLimiter::new(1 << 17));
        let mut sink = CollectingSink::default();
        let (published, delivered) =
            tokio::join!(publisher.publish(writer), deliver(receiver, &mut sink));
        published.unwrap();
        assert_eq!(delivered.unwrap(), 2);
        assert_eq!(sink.completed, 1);

        let kinds: Vec<_> = sink.responses.iter().map(|r| r.payload().kind()).collect();
        assert_eq!(kinds, ["metadata", "verify_keys"]);

        let KeysPayload::Metadata(metadata) = sink.responses[0].payload() else {
            panic!("first response must be metadata");
        };
        assert_eq!(metadata.server_name, "example.org");
        assert!(metadata.valid_until_ts > Utc::now());

        let KeysPayload::VerifyKeys(keys) = sink.responses[1].payload() else {
            panic!("second response must be verify keys");
        };
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("ed25519:1").unwrap().key.as_bytes(), &pubkey[..]);

        for response in &sink.responses {
            assert_eq!(response.signatures().records().len(), 1);
            verify_sub_response(response, "example.org", kp.key_id(), &pubkey).unwrap();
        }
    }

    #[tokio::test]
    async fn retired_keys_get_their_own_response() {
        let kp = Arc::new(ServerKeyPair::generate());
        let retired = vec![
            RetiredKey {
                key_id: KeyId::parse("ed25519:old2").unwrap(),
                key: vec![2; 32],
                expired_ts: DateTime::<Utc>::from_timestamp_millis(2_000).unwrap(),
            },
            RetiredKey {
                key_id: KeyId::parse("ed25519:old1").unwrap(),
                key: vec![1; 32],
                expired_ts: DateTime::<Utc>::from_timestamp_millis(1_000).unwrap(),
            },
        ];
        let ring = KeyRing::new("example.org", kp.clone(), Duration::from_secs(60))
            .with_retired_keys(retired);

        let (writer, receiver) = stream_channel(FlowLimiter::new(1 << 16));
        let mut sink = RecordingSink::default();
        let (published, delivered) = tokio::join!(
            KeyPublisher::new(Arc::new(ring)).publish(writer),
            deliver(receiver, &mut sink)
        );
        published.unwrap();
        assert_eq!(delivered.unwrap(), 3);
        assert_eq!(sink.events, ["metadata", "verify_keys", "old_verify_keys", "complete"]);
    }

    #[test]
    fn retired_keys_keep_configured_order() {
        let kp = Arc::new(ServerKeyPair::generate());
        let retired = ["ed25519:b", "ed25519:a"]
            .into_iter()
            .map(|id| RetiredKey {
                key_id: KeyId::parse(id).unwrap(),
                key: vec![0; 32],
                expired_ts: DateTime::<Utc>::from_timestamp_millis(0).unwrap(),
            })
            .collect();
        let ring = Arc::new(
            KeyRing::new("example.org", kp, Duration::from_secs(60)).with_retired_keys(retired),
        );
        let keys = KeyPublisher::new(ring).old_verify_keys().unwrap();
        let ids: Vec<_> = keys.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["ed25519:b", "ed25519:a"]);
    }

    #[tokio::test]
    async fn signing_failure_aborts_after_first_response() {
        let publisher = KeyPublisher::new(ring_with(Arc::new(FailingSigner::after(1))));
        let (writer, receiver) = stream_channel(FlowLimiter::new(1 << 16));
        let mut sink = RecordingSink::default();

        let (published, delivered) =
            tokio::join!(publisher.publish(writer), deliver(receiver, &mut sink));
        let err = published.unwrap_err();
        assert!(matches!(err, FederationError::Signing(_)), "got {err:?}");
        assert!(matches!(delivered, Err(FederationError::StreamAborted(_))));
        assert_eq!(sink.events, ["metadata"], "one response, no completion");
    }

    #[test]
    fn validity_past_the_calendar_is_an_error() {
        let now = Utc::now();
        assert_eq!(
            valid_until(now, Duration::from_secs(60)).unwrap(),
            now + chrono::Duration::seconds(60)
        );
        assert!(matches!(
            valid_until(now, Duration::from_secs(10_000_000_000_000)),
            Err(FederationError::Validity(_))
        ));
        assert!(matches!(
            valid_until(now, Duration::from_secs(u64::MAX)),
            Err(FederationError::Validity(_))
        ));
    }

    #[tokio::test]
    async fn huge_validity_aborts_instead_of_panicking() {
        let ring = Arc::new(KeyRing::new(
            "example.org",
            Arc::new(ServerKeyPair::generate()),
            Duration::from_secs(10_000_000_000_000),
        ));
        let (writer, receiver) = stream_channel(FlowLimiter::new(1 << 16));
        let mut sink = RecordingSink::default();

        let (published, delivered) =
            tokio::join!(KeyPublisher::new(ring).publish(writer), deliver(receiver, &mut sink));
        assert!(matches!(published, Err(FederationError::Validity(_))));
        assert!(matches!(delivered, Err(FederationError::StreamAborted(_))));
        assert!(sink.events.is_empty());
    }

    #[tokio::test]
    async fn rejected_response_aborts_the_publisher() {
        let publisher = KeyPublisher::new(ring_with(Arc::new(ServerKeyPair::generate())));
        let (writer, receiver) = stream_channel(FlowLimiter::new(1 << 16));
        let mut sink = RecordingSink { reject_at: Some(1), ..Default::default() };

        let (published, delivered) =
            tokio::join!(publisher.publish(writer), deliver(receiver, &mut sink));
        assert!(matches!(published, Err(FederationError::StreamAborted(_))));
        assert!(delivered.is_err());
        assert_eq!(sink.events, ["metadata"]);
    }
}
