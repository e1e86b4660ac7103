//! Wire frames for carrying the federation service over a message transport.
//!
//! Frames are JSON objects tagged `{"op": ..., "d": ...}`. A caller numbers
//! its calls with `call_id`; every reply frame echoes it.
//!
//! ```text
//! client                                   server
//!   │── GetKeys {call_id} ───────────────────►│
//!   │◄─────────────── Write {seq: 0, value} ──│  (holds flow credit)
//!   │── Ack {seq: 0} ────────────────────────►│  (returns it)
//!   │◄─────────────── Write {seq: 1, value} ──│
//!   │── Ack {seq: 1} ────────────────────────►│
//!   │◄──────────────────────────────── Done ──│
//!   │── Ack {seq: 2} ────────────────────────►│  (seq = writes received)
//!   │◄────────────────────────────── Return ──│
//! ```
//!
//! A failed call ends with `Error` instead of `Done`/`Return`.

use serde::{Deserialize, Serialize};

use crate::{
    error::FederationError,
    types::{ServerVersion, SignedSubResponse},
};

/// The methods of the federation service, with their schema method IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetVersion,
    GetKeys,
    SendTransactions,
    Backfill,
}

impl Method {
    pub fn id(self) -> u64 {
        match self {
            Self::GetVersion => 0xab1e_b3e8_1f33_44d1,
            Self::GetKeys => 0x932d_d115_96da_d50e,
            Self::SendTransactions => 0xec6b_6ce1_6700_5c84,
            Self::Backfill => 0x970e_8e8d_fe8f_0ced,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetVersion => "getVersion",
            Self::GetKeys => "getKeys",
            Self::SendTransactions => "sendTransactions",
            Self::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum Frame {
    // ── Client → Server: calls ──────────────────────────────────────────────
    GetVersion { call_id: u64 },
    GetKeys { call_id: u64 },
    SendTransactions { call_id: u64 },
    Backfill { call_id: u64 },

    // ── Client → Server: flow credit ────────────────────────────────────────
    Ack { call_id: u64, seq: u64 },

    // ── Server → Client ─────────────────────────────────────────────────────
    Version { call_id: u64, version: ServerVersion },
    Write { call_id: u64, seq: u64, value: SignedSubResponse },
    Done { call_id: u64 },
    Return { call_id: u64 },
    Error { call_id: u64, kind: String, message: String },
}

impl Frame {
    pub fn call_id(&self) -> u64 {
        match self {
            Self::GetVersion { call_id }
            | Self::GetKeys { call_id }
            | Self::SendTransactions { call_id }
            | Self::Backfill { call_id }
            | Self::Ack { call_id, .. }
            | Self::Version { call_id, .. }
            | Self::Write { call_id, .. }
            | Self::Done { call_id }
            | Self::Return { call_id }
            | Self::Error { call_id, .. } => *call_id,
        }
    }

    /// The method a call frame invokes; `None` for every other frame.
    pub fn method(&self) -> Option<Method> {
        match self {
            Self::GetVersion { .. } => Some(Method::GetVersion),
            Self::GetKeys { .. } => Some(Method::GetKeys),
            Self::SendTransactions { .. } => Some(Method::SendTransactions),
            Self::Backfill { .. } => Some(Method::Backfill),
            _ => None,
        }
    }

    /// The `Error` frame reporting `error` for `call_id`.
    pub fn error(call_id: u64, error: &FederationError) -> Self {
        Self::Error { call_id, kind: error.error_code().to_owned(), message: error.to_string() }
    }

    pub fn to_text(&self) -> Result<String, FederationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, FederationError> {
        Ok(serde_json::from_str(text)?)
    }
}
