//! # Exchange primitives and role state machines
// (c) 2025 Ross Younger
//!
//! [`stream`] turns the frame codec into protocol-meaningful moves:
//! identify, hello/proceed, send/receive a message with its attachments.
//! [`channel`] sequences those moves into complete exchanges from each of
//! the three perspectives:
//!
//! * **Client**: identify once per connection, then per exchange:
//!   `HELLO` ➡️, ⬅️ `PROCEED`, request ➡️, ⬅️ response.
//! * **Subscriber**: identify with a subscription URI, then answer
//!   requests as the server sends them, until the server sends the empty
//!   sentinel envelope.
//! * **Server**: read the peer's identity and run the matching serving
//!   loop: granting exchanges to a client, or draining a pending-request
//!   queue towards a subscriber.
//!
//! Each connection carries one exchange at a time in strict turn order.
//! There is no multiplexing, and no retry or reconnection policy here:
//! when anything other than a handler failure goes wrong, the error
//! propagates and the connection must be discarded.

pub mod channel;
pub mod stream;
