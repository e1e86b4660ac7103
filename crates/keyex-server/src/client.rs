//! Client side of the federation transport: fetch and verify a remote
//! server's keys.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use keyex_federation::{
    FederationError, Frame, KeysPayload, LoggingSink, ServerVersion, SignedSubResponse,
    StreamSink, signatures::verify_sub_response,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info};

/// The verified result of a `GetKeys` call.
#[derive(Debug)]
pub struct FetchedKeys {
    pub version: ServerVersion,
    pub server_name: String,
    pub responses: Vec<SignedSubResponse>,
}

type Connection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ask the server at `url` for its version, then call `GetKeys`, logging every
/// sub-response and checking each signature against the verify keys the same
/// stream published. Each call gets `timeout` to finish.
pub async fn fetch_keys(url: &str, timeout: Duration) -> anyhow::Result<FetchedKeys> {
    let (mut ws, _) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .with_context(|| format!("connecting to {url} timed out after {timeout:?}"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    info!("Connected to {}", url);

    let version = tokio::time::timeout(timeout, get_version(&mut ws, 1))
        .await
        .with_context(|| format!("GetVersion to {url} timed out after {timeout:?}"))??;
    info!("Remote server runs {} {}", version.name, version.version);

    let (server_name, responses) = tokio::time::timeout(timeout, get_keys(&mut ws, 2))
        .await
        .with_context(|| format!("GetKeys to {url} timed out after {timeout:?}"))??;

    let _ = ws.send(Message::Close(None)).await;
    Ok(FetchedKeys { version, server_name, responses })
}

async fn send(ws: &mut Connection, frame: Frame) -> anyhow::Result<()> {
    ws.send(Message::Text(frame.to_text()?.into())).await?;
    Ok(())
}

async fn next_frame(ws: &mut Connection) -> anyhow::Result<Frame> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => return Ok(Frame::from_text(text.as_str())?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    bail!("connection closed before the call returned")
}

async fn get_version(ws: &mut Connection, call_id: u64) -> anyhow::Result<ServerVersion> {
    send(ws, Frame::GetVersion { call_id }).await?;
    loop {
        match next_frame(ws).await? {
            Frame::Version { version, .. } => return Ok(version),
            Frame::Error { kind, message, .. } => bail!("GetVersion failed with {kind}: {message}"),
            other => debug!("Ignoring unexpected frame {:?}", other),
        }
    }
}

async fn get_keys(
    ws: &mut Connection,
    call_id: u64,
) -> anyhow::Result<(String, Vec<SignedSubResponse>)> {
    send(ws, Frame::GetKeys { call_id }).await?;

    let mut sink = LoggingSink::new();
    let mut responses = Vec::new();
    let mut completed = false;
    loop {
        let frame = next_frame(ws).await?;
        if frame.call_id() != call_id {
            bail!("frame for call {} arrived during call {call_id}", frame.call_id());
        }
        match frame {
            Frame::Write { seq, value, .. } => {
                if completed {
                    bail!("write #{seq} arrived after the completion signal");
                }
                let expected = responses.len() as u64;
                if seq != expected {
                    bail!("expected write #{expected}, got #{seq}");
                }
                sink.on_sub_response(&value).await?;
                responses.push(value);
                send(ws, Frame::Ack { call_id, seq }).await?;
            }
            Frame::Done { .. } => {
                if completed {
                    bail!("duplicate completion signal");
                }
                sink.on_complete().await?;
                completed = true;
                send(ws, Frame::Ack { call_id, seq: responses.len() as u64 }).await?;
            }
            Frame::Return { .. } => {
                // Whatever arrived without a completion signal is discarded.
                if !completed {
                    bail!(
                        "GetKeys returned after {} responses without a completion signal",
                        responses.len()
                    );
                }
                let server_name = verify_fetched(&responses)?;
                info!("Verified {} responses from {}", responses.len(), server_name);
                return Ok((server_name, responses));
            }
            Frame::Error { kind, message, .. } => bail!("GetKeys failed with {kind}: {message}"),
            other => debug!("Ignoring unexpected frame {:?}", other),
        }
    }
}

/// Verify every response with the keys from the stream's `verify_keys`
/// response, under the server name from its `metadata` response.
///
/// Returns the verified server name.
pub fn verify_fetched(responses: &[SignedSubResponse]) -> anyhow::Result<String> {
    let server_name = responses
        .iter()
        .find_map(|r| match r.payload() {
            KeysPayload::Metadata(metadata) => Some(metadata.server_name.clone()),
            _ => None,
        })
        .ok_or_else(|| anyhow!("no metadata response in stream"))?;
    let verify_keys = responses
        .iter()
        .find_map(|r| match r.payload() {
            KeysPayload::VerifyKeys(keys) => Some(keys),
            _ => None,
        })
        .ok_or_else(|| anyhow!("no verify_keys response in stream"))?;

    for response in responses {
        let verified = verify_keys.iter().any(|(key_id, key)| {
            verify_sub_response(response, &server_name, key_id, key.key.as_bytes()).is_ok()
        });
        if !verified {
            return Err(FederationError::InvalidSignature)
                .with_context(|| format!("{} response is not signed by {}", response.payload().kind(), server_name));
        }
    }
    Ok(server_name)
}
