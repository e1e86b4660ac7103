//! # keyex-federation
//!
//! Server-to-server key exchange for keyex federation.
//!
//! ## Architecture
//!
//! A remote server calls `GetKeys` and receives a stream of signed
//! sub-responses, each carrying one slice of this server's key material:
//!
//! ```text
//!  remote.tld                      example.org
//!      │                               │
//!      ├─── GetKeys ─────────────────► │
//!      │ ◄──── metadata (signed) ───── │
//!      │ ◄──── verify_keys (signed) ── │
//!      │ ◄──── old_verify_keys ─────── │  (only if keys were retired)
//!      │ ◄──── done ────────────────── │
//! ```
//!
//! ## Key concepts
//!
//! - **Bounded maps** (`bounded_map.rs`): capacity-fixed, insertion-ordered
//!   maps used for every keyed collection on the wire.
//! - **Server keys** (`keys.rs`, `key_manager.rs`): the Ed25519 key pair,
//!   loaded from or generated into a key file at startup.
//! - **Signatures** (`signatures.rs`): canonical encoding of a payload and the
//!   per-server signature records attached to it.
//! - **Publisher** (`publisher.rs`): the state machine that emits the signed
//!   sub-responses in order.
//! - **Streams** (`stream.rs`, `flow.rs`): flow-controlled delivery of those
//!   responses into a caller-supplied sink.
//! - **Service** (`service.rs`, `rpc.rs`): the four federation methods and
//!   their wire frames.

pub mod bounded_map;
pub mod error;
pub mod flow;
pub mod key_manager;
pub mod keys;
pub mod publisher;
pub mod rpc;
pub mod service;
pub mod signatures;
pub mod stream;
pub mod types;

pub use bounded_map::BoundedMap;
pub use error::FederationError;
pub use key_manager::KeyManager;
pub use keys::{KeySigner, ServerKeyPair};
pub use publisher::{KeyPublisher, KeyRing, RetiredKey};
pub use rpc::{Frame, Method};
pub use service::FederationService;
pub use signatures::CanonicalSigner;
pub use stream::{LoggingSink, StreamSink};
pub use types::{KeyId, KeysPayload, ServerVersion, SignedSubResponse};
