//! Exchange state machines for the three protocol roles
// (c) 2025 Ross Younger

use std::io::{Read, Write};

use tracing::{debug, trace, warn};

use crate::error::{ExchangeError, Result};
use crate::exchange::stream::ExchangeStream;
use crate::protocol::messages::{RemoteIdentity, RequestMessage, ResponseMessage, ServerError};

/// The per-subscription work queue a server drains towards a polling
/// subscriber.
///
/// Implemented by the host; the protocol core only ever dequeues requests
/// and hands back responses.
pub trait PendingRequestQueue {
    /// Takes the next pending request, blocking up to the host's configured
    /// polling timeout. `None` means "no work for now": the session is
    /// terminated gracefully and the subscriber will poll again later.
    fn dequeue(&mut self) -> Option<RequestMessage>;

    /// Delivers the response for a previously dequeued request. If the
    /// transport failed mid-exchange this receives an error response
    /// synthesized by the serving loop, so the request's outcome is never
    /// silently lost.
    fn apply_response(&mut self, response: ResponseMessage);
}

/// One connection's exchange state machine, usable in any of the three
/// protocol roles.
///
/// A connection serves one exchange at a time, in strict turn order; the
/// channel is not safe for concurrent use. Concurrency across connections
/// is the host's business.
pub struct ExchangeChannel<W: Write, R: Read> {
    stream: ExchangeStream<W, R>,
    /// Whether we have sent our identity on this connection yet.
    /// Identification happens once per connection, not once per exchange.
    identified: bool,
}

impl<W: Write, R: Read> ExchangeChannel<W, R> {
    /// Constructor, taking the two halves of an established, authenticated
    /// transport.
    pub fn new(send: W, recv: R) -> Self {
        Self {
            stream: ExchangeStream::new(send, recv),
            identified: false,
        }
    }

    /// Direct access to the underlying exchange stream, for hosts that need
    /// to drive the primitives themselves.
    pub fn stream(&mut self) -> &mut ExchangeStream<W, R> {
        &mut self.stream
    }

    // =================================================================================
    // CLIENT

    /// Performs one request/response exchange as a client.
    ///
    /// A connection may be reused for many exchanges; the identity line is
    /// sent only on the first. Failures during identify/hello/proceed are
    /// wrapped as [`ExchangeError::ConnectionInit`]: nothing of the request
    /// has been sent yet, so the caller may retry on a fresh connection.
    /// Failures after that point propagate unchanged and poison the
    /// connection.
    pub fn exchange_as_client(&mut self, request: RequestMessage) -> Result<ResponseMessage> {
        self.prepare_exchange()
            .map_err(|e| ExchangeError::ConnectionInit(Box::new(e)))?;
        self.stream.send_request(request)?;
        self.stream.receive_response()
    }

    fn prepare_exchange(&mut self) -> Result<()> {
        // FUTURE: pooled connections will want a heartbeat exchange here when
        // idle, driven by the tcp_client_heartbeat_* timeouts.
        if !self.identified {
            self.stream.identify_as_client()?;
            self.identified = true;
        }
        self.stream.send_hello()?;
        self.stream.expect_proceed()
    }

    // =================================================================================
    // SUBSCRIBER

    /// Polls the server for work as a subscriber, invoking `handler` on each
    /// request until the server sends the end-of-exchange sentinel.
    ///
    /// Returns the number of requests processed. Handler failures are
    /// converted into error responses and do not end the session.
    pub fn exchange_as_subscriber<H>(
        &mut self,
        subscription: &str,
        mut handler: H,
    ) -> Result<u64>
    where
        H: FnMut(RequestMessage) -> anyhow::Result<ResponseMessage>,
    {
        if !self.identified {
            self.stream.identify_as_subscriber(subscription)?;
            self.identified = true;
        }
        let mut processed = 0u64;
        loop {
            let Some(request) = self.stream.receive_request()? else {
                debug!("server has no more work; processed {processed} request(s)");
                return Ok(processed);
            };
            let response = invoke_and_wrap(request, &mut handler);
            self.stream.send_response(response)?;
            processed += 1;
        }
    }

    // =================================================================================
    // SERVER

    /// Serves one connection: reads the peer's identity, announces ours,
    /// then runs the loop matching the peer's role until it disconnects (for
    /// clients) or the pending queue runs dry (for subscribers).
    ///
    /// `queue_lookup` resolves a subscriber identity to its pending-request
    /// queue; it is only invoked when the peer is a subscriber.
    pub fn exchange_as_server<H, Q, L>(&mut self, handler: H, queue_lookup: L) -> Result<()>
    where
        H: FnMut(RequestMessage) -> anyhow::Result<ResponseMessage>,
        Q: PendingRequestQueue,
        L: FnOnce(&RemoteIdentity) -> Q,
    {
        let identity = self.stream.read_remote_identity()?;
        self.stream.identify_as_server()?;
        match &identity {
            RemoteIdentity::Client => self.serve_client(handler),
            RemoteIdentity::Subscriber { .. } => {
                let queue = queue_lookup(&identity);
                self.serve_subscriber(queue)
            }
            RemoteIdentity::Server => Err(ExchangeError::UnexpectedToken {
                expected: "MX-CLIENT or MX-SUBSCRIBER",
                got: identity.to_string(),
            }),
        }
    }

    /// Serves a pushing client: grant each HELLO, answer each request.
    ///
    /// The loop ends cleanly when the client closes the connection at a turn
    /// boundary (end of stream where the next HELLO would be); anywhere else
    /// a close is an error.
    fn serve_client<H>(&mut self, mut handler: H) -> Result<()>
    where
        H: FnMut(RequestMessage) -> anyhow::Result<ResponseMessage>,
    {
        loop {
            if !self.stream.expect_hello_or_end()? {
                debug!("client finished with the connection");
                return Ok(());
            }
            self.stream.send_proceed()?;
            let Some(request) = self.stream.receive_request()? else {
                return Err(ExchangeError::protocol(
                    "client sent end-of-exchange envelope where a request was required",
                ));
            };
            let response = invoke_and_wrap(request, &mut handler);
            self.stream.send_response(response)?;
        }
    }

    /// Serves a polling subscriber: drain its queue one request at a time,
    /// then send the sentinel.
    ///
    /// If the transport fails after a request was dispatched, an error
    /// response is reported to the queue before the failure propagates, so
    /// the in-flight request's outcome is never left dangling.
    fn serve_subscriber<Q: PendingRequestQueue>(&mut self, mut queue: Q) -> Result<()> {
        loop {
            let Some(request) = queue.dequeue() else {
                trace!("queue is dry; ending subscriber session");
                self.stream.send_end()?;
                return Ok(());
            };
            let correlation = request.id.clone();
            self.stream.send_request(request)?;
            match self.stream.receive_response() {
                Ok(response) => queue.apply_response(response),
                Err(e) => {
                    warn!("exchange failed awaiting response to {correlation}: {e}");
                    let descriptor = ServerError {
                        message: format!("exchange failed awaiting response: {e}"),
                        detail: None,
                    };
                    queue.apply_response(ResponseMessage::from_failure(correlation, descriptor));
                    return Err(e);
                }
            }
        }
    }
}

/// Invokes the handler on a request and wraps any failure into a response,
/// so a misbehaving service method never kills the connection.
///
/// The peer is sent the innermost cause of the failure rather than whatever
/// wrapper chain the handler dressed it in.
fn invoke_and_wrap<H>(request: RequestMessage, handler: &mut H) -> ResponseMessage
where
    H: FnMut(RequestMessage) -> anyhow::Result<ResponseMessage>,
{
    let correlation = request.id.clone();
    match handler(request) {
        Ok(response) => response,
        Err(e) => {
            warn!("handler failed for {correlation}: {e:#}");
            ResponseMessage::from_failure(correlation, ServerError::from_cause(&e))
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////////
