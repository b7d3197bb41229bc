//! Shared data model: identities, versions, envelopes and the two message kinds
// (c) 2025 Ross Younger

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::protocol::attachment::DataStream;

/// Identity token announced by a connecting client
pub(crate) const CLIENT_TOKEN: &str = "MX-CLIENT";
/// Identity token announced by a serving endpoint
pub(crate) const SERVER_TOKEN: &str = "MX-SERVER";
/// Identity token announced by a polling subscriber
pub(crate) const SUBSCRIBER_TOKEN: &str = "MX-SUBSCRIBER";

////////////////////////////////////////////////////////////////////////////////////////
// VERSION

/// Protocol revision, rendered on identity lines as `major.minor`.
///
/// There is no sub-version negotiation: an endpoint that announces a version
/// we do not implement is refused at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    /// Incremented on incompatible changes
    pub major: u16,
    /// Incremented on compatible changes
    pub minor: u16,
}

impl Version {
    /// The protocol revision implemented by this crate
    pub const CURRENT: Version = Version { major: 1, minor: 0 };
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |t: &str| {
            t.parse::<u16>()
                .map_err(|_| ExchangeError::protocol(format!("invalid protocol version {s:?}")))
        };
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| ExchangeError::protocol(format!("invalid protocol version {s:?}")))?;
        Ok(Version {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////
// REMOTE IDENTITY

/// The role a peer declared on its identity line.
///
/// Subscribers always carry the URI of the subscription they are claiming;
/// clients and servers never do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteIdentity {
    /// A request-pushing client
    Client,
    /// A serving endpoint
    Server,
    /// A polling subscriber, claiming the named work queue
    Subscriber {
        /// Durable identifier for the work queue this peer polls
        subscription: String,
    },
}

impl RemoteIdentity {
    /// Parses one identity line.
    ///
    /// Tokens are separated by runs of whitespace. The first token selects
    /// the kind; the second, when present, must be a protocol version we
    /// implement; for subscribers the third is the subscription URI, and its
    /// absence is a protocol error.
    pub fn from_line(line: &str) -> Result<Self, ExchangeError> {
        let mut tokens = line.split_whitespace();
        let kind = tokens
            .next()
            .ok_or_else(|| ExchangeError::protocol("empty identity line"))?;
        if let Some(version) = tokens.next() {
            let version: Version = version.parse()?;
            if version != Version::CURRENT {
                return Err(ExchangeError::protocol(format!(
                    "unsupported protocol version {version} (we speak {})",
                    Version::CURRENT
                )));
            }
        }
        match kind {
            CLIENT_TOKEN => Ok(RemoteIdentity::Client),
            SERVER_TOKEN => Ok(RemoteIdentity::Server),
            SUBSCRIBER_TOKEN => {
                let subscription = tokens.next().ok_or_else(|| {
                    ExchangeError::protocol("subscriber identity line is missing its subscription URI")
                })?;
                Ok(RemoteIdentity::Subscriber {
                    subscription: subscription.to_string(),
                })
            }
            other => Err(ExchangeError::UnexpectedToken {
                expected: "MX-CLIENT, MX-SERVER or MX-SUBSCRIBER",
                got: other.to_string(),
            }),
        }
    }

    /// Renders the identity line announcing this identity at the current
    /// protocol version.
    #[must_use]
    pub fn to_wire_line(&self) -> String {
        match self {
            RemoteIdentity::Client => format!("{CLIENT_TOKEN} {}", Version::CURRENT),
            RemoteIdentity::Server => format!("{SERVER_TOKEN} {}", Version::CURRENT),
            RemoteIdentity::Subscriber { subscription } => {
                format!("{SUBSCRIBER_TOKEN} {} {subscription}", Version::CURRENT)
            }
        }
    }
}

impl Display for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteIdentity::Client => write!(f, "{CLIENT_TOKEN}"),
            RemoteIdentity::Server => write!(f, "{SERVER_TOKEN}"),
            RemoteIdentity::Subscriber { subscription } => {
                write!(f, "{SUBSCRIBER_TOKEN} {subscription}")
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////
// MESSAGES

/// An RPC invocation travelling from caller to service.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation id, unique within a connection. The matching response
    /// carries the same id.
    pub id: String,
    /// Name of the service being invoked
    pub service: String,
    /// Name of the method on that service
    pub method: String,
    /// Method arguments, as an opaque structured document.
    /// Attachments are referenced from here by id.
    #[serde(default)]
    pub params: Vec<bson::Bson>,
    /// Out-of-band binary payloads carried with this request
    #[serde(default)]
    pub attachments: Vec<DataStream>,
}

impl RequestMessage {
    /// Creates a request with no arguments or attachments.
    #[must_use]
    pub fn new<I, S, M>(id: I, service: S, method: M) -> Self
    where
        I: Into<String>,
        S: Into<String>,
        M: Into<String>,
    {
        Self {
            id: id.into(),
            service: service.into(),
            method: method.into(),
            params: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

/// Error descriptor carried inside a [`ResponseMessage`] when the remote
/// service method failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ServerError {
    /// The innermost cause, as the remote saw it
    pub message: String,
    /// Additional context (typically the full error chain), if any
    #[serde(default)]
    pub detail: Option<String>,
}

impl ServerError {
    /// Builds a descriptor from a handler failure.
    ///
    /// The peer is shown the innermost cause, not the wrapper chain; the
    /// full chain travels in `detail` for diagnostics.
    #[must_use]
    pub fn from_cause(error: &anyhow::Error) -> Self {
        let message = error
            .chain()
            .last()
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        Self {
            message,
            detail: Some(format!("{error:#}")),
        }
    }
}

/// The answer to a [`RequestMessage`]: either a result value or an error
/// descriptor, never both.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Correlation id of the request this answers
    pub id: String,
    /// The result value, when the invocation succeeded
    #[serde(default)]
    pub result: Option<bson::Bson>,
    /// The failure descriptor, when it did not
    #[serde(default)]
    pub error: Option<ServerError>,
    /// Out-of-band binary payloads carried with this response
    #[serde(default)]
    pub attachments: Vec<DataStream>,
}

impl ResponseMessage {
    /// Creates a successful response carrying the given result value.
    #[must_use]
    pub fn ok<I: Into<String>>(id: I, result: bson::Bson) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
            attachments: Vec::new(),
        }
    }

    /// Creates a failure response carrying the given error descriptor.
    #[must_use]
    pub fn from_failure<I: Into<String>>(id: I, error: ServerError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
            attachments: Vec::new(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////
// ENVELOPE

/// One message plus its kind tag.
///
/// The discriminator is a closed set: an envelope whose tag names anything
/// other than `request` or `response` fails to deserialize. Accepting open
/// type names off the wire would be a deserialization-gadget risk.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// An RPC invocation
    Request(RequestMessage),
    /// The answer to one
    Response(ResponseMessage),
}

impl Message {
    /// The correlation id of the payload, whichever kind it is
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        match self {
            Message::Request(r) => &r.id,
            Message::Response(r) => &r.id,
        }
    }

    /// The attachments referenced by the payload, in serialization order
    #[must_use]
    pub fn attachments(&self) -> &[DataStream] {
        match self {
            Message::Request(r) => &r.attachments,
            Message::Response(r) => &r.attachments,
        }
    }

    pub(crate) fn attachments_mut(&mut self) -> &mut Vec<DataStream> {
        match self {
            Message::Request(r) => &mut r.attachments,
            Message::Response(r) => &mut r.attachments,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
        }
    }
}

/// The outermost structure of every envelope on the wire: a single `Message`
/// field holding one payload, or holding nothing at all.
///
/// An empty envelope is a legal value: it is the sentinel a server sends to
/// tell a subscriber there is no more work for now.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// The payload, absent in the end-of-session sentinel
    #[serde(rename = "Message")]
    pub message: Option<Message>,
}

impl MessageEnvelope {
    /// The end-of-session sentinel
    #[must_use]
    pub fn sentinel() -> Self {
        Self { message: None }
    }
}

impl From<Message> for MessageEnvelope {
    fn from(message: Message) -> Self {
        Self {
            message: Some(message),
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////////
