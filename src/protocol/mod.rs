//! # Wire protocol definitions and codec
// (c) 2025 Ross Younger
//!
//! Everything on the wire belongs to one of three alphabets:
//!
//! * Text lines: the identity handshake (`MX-CLIENT 1.0`, `MX-SERVER 1.0`,
//!   `MX-SUBSCRIBER 1.0 <uri>`) and the flow-control tokens `HELLO` and
//!   `PROCEED`.
//! * Envelopes: one [`MessageEnvelope`](messages::MessageEnvelope) per
//!   exchange step: a BSON document inside its own DEFLATE stream.
//! * Attachment blocks: raw binary payloads referenced by id from inside
//!   an envelope, following it on the wire uncompressed.
//!
//! [`common`] speaks the alphabets; [`messages`] defines what travels in
//! them; [`attachment`] handles the out-of-band payloads and their spooled
//! storage on the receiving side. The state machines that sequence all of
//! this live in [`crate::exchange`].

pub mod attachment;
pub(crate) mod common;
pub mod messages;
