//! Protocol-meaningful primitives over the frame codec
// (c) 2025 Ross Younger

use std::fs::{self, File};
use std::io::{Read, Write};

use tracing::{debug, trace};

use crate::error::{ExchangeError, Result};
use crate::protocol::attachment::{spool_path, StreamCapture};
use crate::protocol::common::{FrameReader, FrameWriter};
use crate::protocol::messages::{
    Message, MessageEnvelope, RemoteIdentity, RequestMessage, ResponseMessage,
};

/// Flow-control line sent by whoever wants to start an exchange
const HELLO: &str = "HELLO";
/// Flow-control line granting the exchange
const PROCEED: &str = "PROCEED";

/// The exchange stream: everything the role state machines need to say, one
/// primitive per protocol step.
///
/// The stream exclusively owns both halves of the transport and the buffers
/// over them; nothing else may touch the transport between construction and
/// teardown. It is strictly sequential (reads and writes alternate in the
/// order the state machine dictates) and is not safe for concurrent use.
///
/// Every write is followed by an explicit flush. Every read that fails to
/// match the expected token reports both the expectation and what actually
/// arrived.
pub struct ExchangeStream<W: Write, R: Read> {
    writer: FrameWriter<W>,
    reader: FrameReader<R>,
}

impl<W: Write, R: Read> ExchangeStream<W, R> {
    /// Constructor, taking the two halves of an established transport.
    pub fn new(send: W, recv: R) -> Self {
        Self {
            writer: FrameWriter::new(send),
            reader: FrameReader::new(recv),
        }
    }

    // =================================================================================
    // IDENTIFICATION

    /// Announces this endpoint as a client, then verifies the remote is a
    /// server.
    pub fn identify_as_client(&mut self) -> Result<()> {
        self.write_identity(&RemoteIdentity::Client)?;
        self.expect_server_identity()
    }

    /// Announces this endpoint as a subscriber claiming the given
    /// subscription, then verifies the remote is a server.
    pub fn identify_as_subscriber(&mut self, subscription: &str) -> Result<()> {
        self.write_identity(&RemoteIdentity::Subscriber {
            subscription: subscription.to_string(),
        })?;
        self.expect_server_identity()
    }

    /// Announces this endpoint as a server.
    pub fn identify_as_server(&mut self) -> Result<()> {
        self.write_identity(&RemoteIdentity::Server)
    }

    /// Reads and parses the remote's identity line.
    pub fn read_remote_identity(&mut self) -> Result<RemoteIdentity> {
        let line = self.reader.read_line()?.ok_or_else(|| {
            ExchangeError::protocol("end of stream while awaiting remote identity")
        })?;
        let identity = RemoteIdentity::from_line(&line)?;
        debug!("remote identified as {identity}");
        Ok(identity)
    }

    /// Identity lines are followed by an extra blank line so a human tailing
    /// the conversation can find them.
    fn write_identity(&mut self, identity: &RemoteIdentity) -> Result<()> {
        debug!("identifying as {identity}");
        self.writer.write_line(&identity.to_wire_line())?;
        self.writer.write_line("")?;
        self.writer.flush()
    }

    fn expect_server_identity(&mut self) -> Result<()> {
        match self.read_remote_identity()? {
            RemoteIdentity::Server => Ok(()),
            other => Err(ExchangeError::UnexpectedToken {
                expected: "MX-SERVER",
                got: other.to_string(),
            }),
        }
    }

    // =================================================================================
    // FLOW CONTROL

    /// Asks to start an exchange.
    pub fn send_hello(&mut self) -> Result<()> {
        self.writer.write_line(HELLO)?;
        self.writer.flush()
    }

    /// Grants an exchange.
    pub fn send_proceed(&mut self) -> Result<()> {
        self.writer.write_line(PROCEED)?;
        self.writer.flush()
    }

    /// Requires the next line to be `HELLO`.
    pub fn expect_hello(&mut self) -> Result<()> {
        if self.expect_hello_or_end()? {
            Ok(())
        } else {
            Err(ExchangeError::protocol("end of stream while awaiting HELLO"))
        }
    }

    /// Like [`expect_hello`](Self::expect_hello), but end-of-stream here is
    /// a legal way for the peer to finish with the connection: returns
    /// `false` rather than raising.
    pub(crate) fn expect_hello_or_end(&mut self) -> Result<bool> {
        match self.reader.read_line()? {
            None => Ok(false),
            Some(line) if line == HELLO => Ok(true),
            Some(other) => Err(ExchangeError::UnexpectedToken {
                expected: HELLO,
                got: other,
            }),
        }
    }

    /// Requires the next line to be `PROCEED`.
    ///
    /// End-of-stream here is reported as [`ExchangeError::Rejected`], not a
    /// generic protocol error: a peer that accepts the handshake and then
    /// silently hangs up at this exact point has almost always rejected our
    /// credentials at the TLS layer above.
    pub fn expect_proceed(&mut self) -> Result<()> {
        match self.reader.read_line()? {
            None => Err(ExchangeError::Rejected),
            Some(line) if line == PROCEED => Ok(()),
            Some(other) => Err(ExchangeError::UnexpectedToken {
                expected: PROCEED,
                got: other,
            }),
        }
    }

    // =================================================================================
    // MESSAGES

    /// Sends one message: envelope first, then every attachment it
    /// references, in registration order.
    pub fn send(&mut self, message: Message) -> Result<()> {
        let mut envelope = MessageEnvelope::from(message);
        let capture = StreamCapture::collect(&envelope)?;
        if let Some(message) = &envelope.message {
            trace!(
                "sending {} {} with {} attachment(s)",
                message.kind(),
                message.correlation_id(),
                capture.len()
            );
        }
        self.writer.write_envelope(&envelope)?;
        if let Some(message) = envelope.message.as_mut() {
            for stream in message.attachments_mut() {
                self.writer.write_attachment(stream)?;
            }
        }
        self.writer.flush()
    }

    /// Sends the end-of-exchange sentinel: an envelope carrying nothing.
    pub fn send_end(&mut self) -> Result<()> {
        trace!("sending end-of-exchange envelope");
        self.writer.write_envelope(&MessageEnvelope::sentinel())?;
        self.writer.flush()
    }

    /// Receives one message, draining its attachments off the wire before
    /// returning. `None` is the end-of-exchange sentinel.
    ///
    /// Each incoming attachment block is matched to the descriptor with the
    /// same id inside the envelope (a block with no matching descriptor is
    /// fatal) and its payload is spooled to a temporary file which the
    /// descriptor will serve up exactly once.
    pub fn receive(&mut self) -> Result<Option<Message>> {
        let mut envelope = self.reader.read_envelope()?;
        let capture = StreamCapture::collect(&envelope)?;
        match envelope.message.as_mut() {
            None => {
                trace!("received end-of-exchange envelope");
                return Ok(None);
            }
            Some(message) => {
                for _ in 0..capture.len() {
                    self.receive_attachment(message)?;
                }
                trace!(
                    "received {} {} with {} attachment(s)",
                    message.kind(),
                    message.correlation_id(),
                    capture.len()
                );
            }
        }
        Ok(envelope.message)
    }

    fn receive_attachment(&mut self, message: &mut Message) -> Result<()> {
        let (id, length) = self.reader.read_attachment_header()?;
        let stream = message
            .attachments_mut()
            .iter_mut()
            .find(|s| s.id() == id && s.is_detached())
            .ok_or_else(|| {
                ExchangeError::protocol(format!("attachment block with unknown id {id}"))
            })?;
        if stream.length() != length {
            return Err(ExchangeError::protocol(format!(
                "attachment {id}: envelope declares {} bytes but block carries {length}",
                stream.length()
            )));
        }
        let path = spool_path(id);
        let mut file = File::create(&path)?;
        let spooled = self.reader.read_attachment_payload(length, &mut file);
        drop(file);
        if let Err(e) = spooled {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        trace!("spooled attachment {id} ({length} bytes) to {path:?}");
        stream.bind_spool(path)
    }

    /// Sends a request message.
    pub fn send_request(&mut self, request: RequestMessage) -> Result<()> {
        self.send(Message::Request(request))
    }

    /// Sends a response message.
    pub fn send_response(&mut self, response: ResponseMessage) -> Result<()> {
        self.send(Message::Response(response))
    }

    /// Receives a request, or `None` at the end-of-exchange sentinel.
    pub fn receive_request(&mut self) -> Result<Option<RequestMessage>> {
        match self.receive()? {
            None => Ok(None),
            Some(Message::Request(request)) => Ok(Some(request)),
            Some(Message::Response(_)) => Err(ExchangeError::UnexpectedToken {
                expected: "request envelope",
                got: "response envelope".to_string(),
            }),
        }
    }

    /// Receives a response. The sentinel is not legal here: a peer that owes
    /// us a response may not end the exchange instead.
    pub fn receive_response(&mut self) -> Result<ResponseMessage> {
        match self.receive()? {
            Some(Message::Response(response)) => Ok(response),
            Some(Message::Request(_)) => Err(ExchangeError::UnexpectedToken {
                expected: "response envelope",
                got: "request envelope".to_string(),
            }),
            None => Err(ExchangeError::UnexpectedToken {
                expected: "response envelope",
                got: "end-of-exchange envelope".to_string(),
            }),
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////////
