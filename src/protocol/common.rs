//! Frame codec: text lines, compressed envelopes, raw attachment blocks
// (c) 2025 Ross Younger
//!
//! # On-wire framing
//!
//! Three alphabets share the transport, in a strict order decided by the
//! exchange state machine:
//!
//! * **Text lines**: UTF-8, no BOM, terminated by a line break. Readers
//!   treat blank lines as invisible: "read the next line" means the next
//!   non-empty one.
//! * **Envelopes**: one BSON document per envelope, wrapped in its own
//!   DEFLATE stream. The compressor is opened and closed per envelope and
//!   never closes the transport. The stream terminator is what tells the
//!   receiver where compressed data ends and raw bytes resume.
//! * **Attachment blocks**: a 16-byte id, an 8-byte signed little-endian
//!   length, then exactly that many payload bytes, back to back with no
//!   further framing. Blocks are written uncompressed, immediately after
//!   their envelope's DEFLATE stream ends.

use std::io::{self, BufRead, BufReader, Read, Write};

use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::error::{ExchangeError, Result};
use crate::protocol::attachment::DataStream;
use crate::protocol::messages::MessageEnvelope;

/////////////////////////////////////////////////////////////////////////////////////////////
// WRITER

/// Writing half of the frame codec. Owns its half of the transport.
pub(crate) struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one text line.
    pub(crate) fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(b"\n")?;
        Ok(())
    }

    /// Serializes one envelope into a fresh DEFLATE stream.
    ///
    /// The compressor is closed at the end of the envelope; the transport
    /// stays open.
    pub(crate) fn write_envelope(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        let body = bson::to_vec(envelope)?;
        let mut encoder = DeflateEncoder::new(&mut self.inner, Compression::default());
        encoder.write_all(&body)?;
        let _ = encoder.finish()?;
        Ok(())
    }

    /// Writes one attachment block: id, length, payload.
    pub(crate) fn write_attachment(&mut self, stream: &mut DataStream) -> Result<()> {
        self.inner.write_all(stream.id().as_bytes())?;
        let length = i64::try_from(stream.length()).map_err(|_| {
            ExchangeError::protocol(format!("attachment {} length exceeds i64", stream.id()))
        })?;
        self.inner.write_all(&length.to_le_bytes())?;
        stream.write_payload(&mut self.inner)
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get_ref(&self) -> &W {
        &self.inner
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// READER

/// Reading half of the frame codec. Owns its half of the transport and the
/// buffer layered over it.
pub(crate) struct FrameReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Reads the next non-empty line, or `None` at end of stream.
    ///
    /// Blank lines (including whitespace-only ones) are skipped, so this
    /// never returns an empty string.
    pub(crate) fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            let mut line = String::new();
            let n = self.inner.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Deserializes one envelope from a DEFLATE stream.
    ///
    /// The decoder works through our buffer and consumes only the bytes
    /// belonging to the compressed stream, so whatever follows it (the
    /// first attachment block, or the next line) stays buffered for the
    /// next read. A compressed stream holding anything beyond the one
    /// document is a protocol error.
    pub(crate) fn read_envelope(&mut self) -> Result<MessageEnvelope> {
        let mut decoder = DeflateDecoder::new(&mut self.inner);
        let envelope: MessageEnvelope = bson::from_reader(&mut decoder)?;
        // Drain up to the stream terminator so the buffer is positioned on
        // the first byte after the compressed data.
        let mut probe = [0u8; 1];
        if decoder.read(&mut probe)? != 0 {
            return Err(ExchangeError::protocol(
                "unexpected data after envelope in compressed stream",
            ));
        }
        Ok(envelope)
    }

    /// Reads an attachment block header: id and payload length.
    pub(crate) fn read_attachment_header(&mut self) -> Result<(Uuid, u64)> {
        let mut id = [0u8; 16];
        self.inner.read_exact(&mut id)?;
        let mut length = [0u8; 8];
        self.inner.read_exact(&mut length)?;
        let length = i64::from_le_bytes(length);
        let length = u64::try_from(length).map_err(|_| {
            ExchangeError::protocol(format!("negative attachment length {length}"))
        })?;
        Ok((Uuid::from_bytes(id), length))
    }

    /// Copies exactly `length` payload bytes into `out`.
    pub(crate) fn read_attachment_payload(
        &mut self,
        length: u64,
        out: &mut dyn Write,
    ) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(length), out)?;
        if copied == length {
            Ok(())
        } else {
            Err(ExchangeError::protocol(format!(
                "truncated attachment: expected {length} bytes, got {copied}"
            )))
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
