//! The federation service: the four methods a remote server can call.
//!
//! | Method | Behaviour |
//! |--------|-----------|
//! | `GetVersion` | Software name and version |
//! | `GetKeys` | Streams signed key sub-responses into the caller's sink |
//! | `SendTransactions` | Accepted and ignored |
//! | `Backfill` | Accepted and ignored |
//!
//! Each `GetKeys` call runs its own [`KeyPublisher`] and stream. The only
//! state shared between calls is the read-only [`KeyRing`].

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::FederationError,
    flow::FlowLimiter,
    publisher::{KeyPublisher, KeyRing},
    stream::{StreamSink, deliver, stream_channel},
    types::ServerVersion,
};

/// Default in-flight byte budget per stream.
pub const DEFAULT_FLOW_WINDOW: u32 = 1 << 17;

/// Default deadline for a whole `GetKeys` call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FederationService {
    ring: Arc<KeyRing>,
    flow_window: u32,
    request_timeout: Duration,
}

impl FederationService {
    pub fn new(ring: Arc<KeyRing>) -> Self {
        Self { ring, flow_window: DEFAULT_FLOW_WINDOW, request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }

    pub fn with_flow_window(mut self, bytes: u32) -> Self {
        self.flow_window = bytes;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    /// `GetVersion`
    pub fn get_version(&self) -> ServerVersion {
        ServerVersion::current()
    }

    /// `GetKeys`
    ///
    /// Streams every signed sub-response into `sink`, followed by completion.
    /// Returns the number of sub-responses delivered. On error the sink has
    /// not been completed and whatever it saw must be discarded.
    pub async fn get_keys<S>(&self, sink: &mut S) -> Result<u64, FederationError>
    where
        S: StreamSink + ?Sized,
    {
        let (writer, receiver) = stream_channel(FlowLimiter::new(self.flow_window));
        let publisher = KeyPublisher::new(self.ring.clone());

        let call = async {
            let (published, delivered) =
                tokio::join!(publisher.publish(writer), deliver(receiver, sink));
            match (published, delivered) {
                (Ok(()), Ok(count)) => Ok(count),
                // The publisher only saw the stream close; the sink's error came first.
                (Err(FederationError::StreamAborted(_)), Err(sink_error)) => Err(sink_error),
                (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            }
        };

        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(Ok(count)) => {
                info!("GetKeys delivered {} responses", count);
                Ok(count)
            }
            Ok(Err(e)) => {
                warn!("GetKeys failed: {} ({})", e, e.error_code());
                Err(e)
            }
            Err(_) => {
                warn!("GetKeys exceeded its {:?} deadline", self.request_timeout);
                Err(FederationError::StreamAborted("request deadline exceeded".into()))
            }
        }
    }

    /// `SendTransactions`: not implemented beyond acknowledging the call.
    pub async fn send_transactions(&self) -> Result<(), FederationError> {
        debug!("SendTransactions called; nothing to do");
        Ok(())
    }

    /// `Backfill`: not implemented beyond acknowledging the call.
    pub async fn backfill(&self) -> Result<(), FederationError> {
        debug!("Backfill called; nothing to do");
        Ok(())
    }
}
