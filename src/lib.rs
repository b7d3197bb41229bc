// (c) 2025 Ross Younger

//! `mxp` is the message-exchange core of a secure bidirectional RPC
//! framework: the framing layer and exchange state machine that run over an
//! already-established reliable byte transport (typically a TLS-wrapped TCP
//! stream).
//!
//! ## Overview
//!
//! Two endpoints exchange RPC request/response messages in one of two
//! directions:
//!
//! - **push**: a client connects, identifies, and sends requests which the
//!   server answers;
//! - **pull**: a subscriber connects, identifies with a subscription URI,
//!   and the server feeds it queued requests to execute, collecting the
//!   responses.
//!
//! Messages travel as DEFLATE-compressed BSON envelopes. Each envelope may
//! reference any number of opaque binary *attachments*, which follow it on
//! the wire as raw length-prefixed blocks, so large payloads never transit
//! the document codec and are never reassembled in memory on receipt.
//!
//! ## Layering
//!
//! * [`protocol`]: the wire. Frame codec, message model, attachments.
//! * [`exchange`]: the conversation. Stream primitives and the role state
//!   machines.
//! * [`config`]: the tunable timeout defaults.
//!
//! ## What this crate does not do
//!
//! Transport establishment, TLS, certificate pinning, connection pooling,
//! request dispatch and the pending-request queue are the host's business;
//! this crate defines the traits and message types where they plug in.
//! Diagnostics are emitted as [`tracing`] events; the host owns the
//! subscriber.

pub mod config;
mod error;
pub mod exchange;
pub mod protocol;

pub use config::Timeouts;
pub use error::ExchangeError;
pub use exchange::channel::{ExchangeChannel, PendingRequestQueue};
pub use exchange::stream::ExchangeStream;
pub use protocol::attachment::DataStream;
pub use protocol::messages::{
    Message, MessageEnvelope, RemoteIdentity, RequestMessage, ResponseMessage, ServerError,
    Version,
};
