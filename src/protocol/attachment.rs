//! Attachment descriptors and their spooled backing storage
// (c) 2025 Ross Younger

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ExchangeError, Result};
use crate::protocol::messages::MessageEnvelope;

/// Where a received attachment is spooled while it waits to be consumed.
///
/// The filename is derived from the attachment id, which is unique across
/// all connections, so concurrent connections sharing the temp directory
/// cannot collide.
#[must_use]
pub fn spool_path(id: Uuid) -> PathBuf {
    std::env::temp_dir().join(format!("mxp-{}", id.simple()))
}

////////////////////////////////////////////////////////////////////////////////////////
// DATA STREAM

/// An out-of-band binary payload referenced by id from within an envelope.
///
/// Only the id and byte length travel inside the envelope; the bytes
/// themselves follow the envelope on the wire as a raw block.
///
/// On the sending side a descriptor knows how to produce its bytes (from
/// memory or from a caller-supplied reader). On the receiving side the bytes
/// are spooled to a temporary file, never reassembled in memory (they may
/// be arbitrarily large) and can be read exactly once; the file is deleted
/// as soon as that read finishes, however it finishes.
#[derive(Debug)]
pub struct DataStream {
    id: Uuid,
    length: u64,
    source: Source,
}

enum Source {
    /// Sender side: bytes held in memory
    Bytes(Vec<u8>),
    /// Sender side: bytes produced on demand
    Reader(Box<dyn Read + Send>),
    /// Receiver side: bytes spooled to a temporary file
    Spooled(SpoolFile),
    /// Deserialized from an envelope, bytes not yet arrived
    Detached,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Source::Reader(_) => write!(f, "Reader"),
            Source::Spooled(s) => write!(f, "Spooled({:?})", s.path),
            Source::Detached => write!(f, "Detached"),
        }
    }
}

/// Semantic equality: two descriptors are the same attachment if they agree
/// on id and length. Byte contents live out-of-band.
impl PartialEq for DataStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.length == other.length
    }
}

impl DataStream {
    /// Creates a sender-side attachment over an in-memory buffer.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            length: bytes.len() as u64,
            source: Source::Bytes(bytes),
        }
    }

    /// Creates a sender-side attachment over a reader.
    ///
    /// The reader must produce exactly `length` bytes when the attachment is
    /// transmitted; producing fewer is a protocol error at send time.
    #[must_use]
    pub fn from_reader(length: u64, reader: Box<dyn Read + Send>) -> Self {
        Self {
            id: Uuid::new_v4(),
            length,
            source: Source::Reader(reader),
        }
    }

    /// The attachment's 128-bit identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The attachment's byte length
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn is_detached(&self) -> bool {
        matches!(self.source, Source::Detached)
    }

    /// Attaches the spooled file holding this attachment's received bytes.
    pub(crate) fn bind_spool(&mut self, path: PathBuf) -> Result<()> {
        if !self.is_detached() {
            return Err(ExchangeError::protocol(format!(
                "attachment {} received more than once",
                self.id
            )));
        }
        self.source = Source::Spooled(SpoolFile {
            path,
            consumed: false,
        });
        Ok(())
    }

    /// Sender side: copies this attachment's bytes into `out`.
    pub(crate) fn write_payload(&mut self, out: &mut dyn Write) -> Result<()> {
        match &mut self.source {
            Source::Bytes(bytes) => {
                out.write_all(bytes)?;
                Ok(())
            }
            Source::Reader(reader) => {
                let copied = io::copy(reader, out)?;
                if copied == self.length {
                    Ok(())
                } else {
                    Err(ExchangeError::protocol(format!(
                        "attachment {} produced {copied} bytes, expected {}",
                        self.id, self.length
                    )))
                }
            }
            Source::Spooled(_) | Source::Detached => Err(ExchangeError::protocol(format!(
                "attachment {} has no sender-side payload",
                self.id
            ))),
        }
    }

    /// Receiver side: reads the spooled bytes, exactly once.
    ///
    /// The callback is handed a reader over the spooled file. The file is
    /// deleted as soon as the callback returns, whether or not it succeeded,
    /// and any further read attempt fails.
    pub fn read<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<T>,
    {
        let Source::Spooled(spool) = &mut self.source else {
            return Err(ExchangeError::protocol(format!(
                "attachment {} has no received payload to read",
                self.id
            )));
        };
        if spool.consumed {
            return Err(ExchangeError::protocol(format!(
                "attachment {} has already been consumed",
                self.id
            )));
        }
        spool.consumed = true;
        let result = (|| {
            let mut file = File::open(&spool.path)?;
            f(&mut file)
        })();
        if let Err(e) = fs::remove_file(&spool.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not remove spooled attachment {:?}: {e}", spool.path);
            }
        }
        Ok(result?)
    }

    /// Receiver side convenience: reads the whole attachment into memory.
    ///
    /// Only sensible for attachments known to be of modest size; the point
    /// of the spool file is that they need not be.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        self.read(|r| {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf)?;
            Ok(buf)
        })
    }
}

/// Receiver-side backing file. `consumed` flips exactly once; deletion on
/// drop covers the case where a receiver never reads the attachment.
#[derive(Debug)]
struct SpoolFile {
    path: PathBuf,
    consumed: bool,
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if !self.consumed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////
// WIRE FORM

/// Only the id and length travel inside the envelope. The id is rendered as
/// 32 hex digits so the encoding does not depend on how any particular
/// document codec treats native binary.
impl Serialize for DataStream {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct as _;
        let length = i64::try_from(self.length)
            .map_err(|_| serde::ser::Error::custom("attachment length exceeds i64"))?;
        let mut st = serializer.serialize_struct("DataStream", 2)?;
        st.serialize_field("id", &self.id.simple().to_string())?;
        st.serialize_field("length", &length)?;
        st.end()
    }
}

#[derive(Deserialize)]
struct WireDataStream {
    id: String,
    length: i64,
}

impl<'de> Deserialize<'de> for DataStream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = WireDataStream::deserialize(deserializer)?;
        let id = Uuid::parse_str(&wire.id).map_err(|_| {
            serde::de::Error::custom(format!("invalid attachment id {:?}", wire.id))
        })?;
        let length = u64::try_from(wire.length)
            .map_err(|_| serde::de::Error::custom("negative attachment length"))?;
        Ok(DataStream {
            id,
            length,
            source: Source::Detached,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////
// STREAM CAPTURE

/// The registry of attachments referenced by one envelope, in the order the
/// serializer encounters them.
///
/// One capture is built per send and per receive, by walking the message;
/// there is no ambient state. On the sending side it validates the envelope
/// before any bytes hit the wire; on the receiving side its length is the
/// number of attachment blocks that must follow the envelope.
#[derive(Debug)]
pub(crate) struct StreamCapture {
    ids: Vec<Uuid>,
}

impl StreamCapture {
    /// Walks the envelope and registers every attachment descriptor.
    ///
    /// Duplicate ids within one envelope are a protocol error: the receiver
    /// would have no way to tell the blocks apart.
    pub(crate) fn collect(envelope: &MessageEnvelope) -> Result<Self> {
        let mut ids = Vec::new();
        if let Some(message) = &envelope.message {
            for stream in message.attachments() {
                if ids.contains(&stream.id()) {
                    return Err(ExchangeError::protocol(format!(
                        "duplicate attachment id {} within one envelope",
                        stream.id()
                    )));
                }
                ids.push(stream.id());
            }
        }
        Ok(Self { ids })
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////////
