//! Ordered push-streams of signed sub-responses.
//!
//! ```text
//!  KeyPublisher ──write()──► StreamWriter ══ mpsc ══► StreamReceiver ──deliver()──► StreamSink
//!                 (credit)                                           on_sub_response / on_complete
//! ```
//!
//! Every [`StreamWriter::write`] reserves flow credit sized to the message and
//! enqueues it; the credit travels with the message and is released once the
//! sink's `on_sub_response` returns. [`StreamWriter::done`] enqueues the
//! completion signal and waits until the sink has processed it, so it can only
//! succeed after every earlier message was accepted.
//!
//! A writer dropped without `done()` closes the stream; [`deliver`] reports that
//! as [`FederationError::StreamAborted`], never as an empty result.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    error::FederationError,
    flow::{FlowCredit, FlowLimiter},
    types::{KeysPayload, SignedSubResponse},
};

// ─── Sink contract ───────────────────────────────────────────────────────────

/// Receiving side of a `GetKeys` stream.
///
/// Callbacks take `&mut self`: a sink instance serves one stream at a time, so
/// calls for two requests can never interleave on it.
#[async_trait]
pub trait StreamSink: Send {
    /// Called once per sub-response, in emission order. The response is only
    /// borrowed for the duration of the call.
    async fn on_sub_response(&mut self, response: &SignedSubResponse) -> Result<(), FederationError>;

    /// Called once, after the last sub-response, iff the publisher completed.
    async fn on_complete(&mut self) -> Result<(), FederationError>;
}

// ─── Channel ─────────────────────────────────────────────────────────────────

enum StreamEvent {
    Write { seq: u64, response: SignedSubResponse, _credit: FlowCredit },
    Done { ack: oneshot::Sender<Result<(), String>> },
}

/// Publisher-side handle of a stream.
pub struct StreamWriter {
    // Unbounded: the flow limiter bounds what is queued.
    tx: mpsc::UnboundedSender<StreamEvent>,
    limiter: FlowLimiter,
    next_seq: u64,
}

/// Receiver-side handle of a stream; drive it with [`deliver`].
pub struct StreamReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Open a stream whose in-flight bytes are bounded by `limiter`.
pub fn stream_channel(limiter: FlowLimiter) -> (StreamWriter, StreamReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamWriter { tx, limiter, next_seq: 0 }, StreamReceiver { rx })
}

impl StreamWriter {
    /// Number of sub-responses submitted so far.
    pub fn written(&self) -> u64 {
        self.next_seq
    }

    /// Submit one sub-response, suspending while the flow window is full.
    pub async fn write(&mut self, response: SignedSubResponse) -> Result<(), FederationError> {
        let size = bincode::serialized_size(&response)?;
        let credit = self.limiter.reserve(size).await?;
        let seq = self.next_seq;
        self.tx
            .send(StreamEvent::Write { seq, response, _credit: credit })
            .map_err(|_| FederationError::StreamAborted("receiver closed the stream".into()))?;
        self.next_seq += 1;
        debug!("Stream write #{} queued ({} bytes)", seq, size);
        Ok(())
    }

    /// Signal completion and wait for the receiver to accept it.
    pub async fn done(self) -> Result<(), FederationError> {
        let (ack, accepted) = oneshot::channel();
        self.tx
            .send(StreamEvent::Done { ack })
            .map_err(|_| FederationError::StreamAborted("receiver closed the stream".into()))?;
        match accepted.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(FederationError::StreamAborted(reason)),
            Err(_) => Err(FederationError::StreamAborted(
                "receiver closed the stream before completion".into(),
            )),
        }
    }
}

/// Feed every message of `stream` to `sink`, in order.
///
/// Returns the number of sub-responses delivered once the completion signal
/// has been handled. Fails if the sink rejects a message or the stream closes
/// without completion; any sub-responses seen before that must be discarded.
pub async fn deliver<S>(stream: StreamReceiver, sink: &mut S) -> Result<u64, FederationError>
where
    S: StreamSink + ?Sized,
{
    let mut rx = stream.rx;
    let mut delivered = 0u64;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Write { seq, response, _credit } => {
                debug!("Delivering stream write #{}", seq);
                sink.on_sub_response(&response).await?;
                delivered += 1;
                // `response` and its credit drop here.
            }
            StreamEvent::Done { ack } => {
                let result = sink.on_complete().await;
                let _ = ack.send(result.as_ref().map(|_| ()).map_err(ToString::to_string));
                return result.map(|_| delivered);
            }
        }
    }
    warn!("Stream closed after {} writes without a completion signal", delivered);
    Err(FederationError::StreamAborted("stream closed without completion".into()))
}

// ─── Logging sink ────────────────────────────────────────────────────────────

/// A sink that logs everything it receives.
#[derive(Debug, Default)]
pub struct LoggingSink {
    received: u64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl StreamSink for LoggingSink {
    async fn on_sub_response(&mut self, response: &SignedSubResponse) -> Result<(), FederationError> {
        self.received += 1;
        match response.payload() {
            KeysPayload::Metadata(metadata) => info!(
                "Server keys metadata: server_name={:?} valid_until_ts={}",
                metadata.server_name,
                metadata.valid_until_ts.timestamp_millis()
            ),
            KeysPayload::VerifyKeys(keys) => {
                for (key_id, key) in keys.iter() {
                    info!("Server keys verify_keys entry: key_id={:?} key={}", key_id.as_str(), key.key.to_base64());
                }
            }
            KeysPayload::OldVerifyKeys(keys) => {
                for (key_id, key) in keys.iter() {
                    info!(
                        "Server keys old_verify_keys entry: key_id={:?} key={} expired_ts={}",
                        key_id.as_str(),
                        key.key.to_base64(),
                        key.expired_ts.timestamp_millis()
                    );
                }
            }
        }

        if response.signatures().records().is_empty() {
            info!("Server keys response has no signatures");
        }
        for record in response.signatures().records() {
            for (key_id, signature) in record.signatures.iter() {
                info!(
                    "Server keys signature: server={:?} key_id={:?} signature={}",
                    record.server,
                    key_id.as_str(),
                    signature.to_base64()
                );
            }
        }
        Ok(())
    }

    async fn on_complete(&mut self) -> Result<(), FederationError> {
        info!("Server keys stream complete after {} responses", self.received);
        Ok(())
    }
}
