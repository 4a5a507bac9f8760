//! BER (X.690) primitives and LDAP PDU framing.
//!
//! LDAP messages are BER SEQUENCEs: `SEQUENCE { messageID, protocolOp,
//! controls [0] OPTIONAL }`. This module reads complete PDUs off a socket
//! buffer and exposes primitive readers/writers used by the message model.
//! Indefinite lengths are rejected; lengths are capped at 4 octets.

use bytes::BytesMut;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Largest PDU the framing layer will buffer before giving up on a client.
const MAX_PDU_LEN: usize = 8 * 1024 * 1024;

/// Top-level LDAP message tag: universal SEQUENCE.
const SEQUENCE_TAG: u8 = 0x30;

/// One complete BER-encoded LDAP PDU, with its envelope pre-parsed.
///
/// The protocolOp application tag is surfaced so the message model can
/// dispatch without re-walking the envelope.
#[derive(Debug, Clone)]
pub struct Packet {
    message_id: i32,
    request_tag: u8,
    bytes: Vec<u8>,
}

impl Packet {
    /// Parse a complete PDU from `bytes`. Fails if the buffer does not hold
    /// exactly one well-formed LDAP envelope.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Packet> {
        let mut reader = BerReader::new(&bytes);
        let _seq_len = reader.read_sequence()?;
        let message_id = reader.read_integer()?;
        let request_tag = reader.read_tag()?;
        Ok(Packet {
            message_id,
            request_tag,
            bytes,
        })
    }

    /// The messageID from the PDU envelope.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// The application tag of the protocolOp (e.g. 0x60 for BindRequest).
    pub fn request_tag(&self) -> u8 {
        self.request_tag
    }

    /// Raw bytes of the whole PDU.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Total on-wire length of the PDU starting at `buf[0]`, or `None` if more
/// bytes are needed to decide.
fn pdu_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != SEQUENCE_TAG {
        return Err(Error::protocol(format!(
            "expected SEQUENCE (0x30) at start of PDU, got 0x{:02X}",
            buf[0]
        )));
    }
    let first = buf[1];
    if first & 0x80 == 0 {
        return Ok(Some(2 + first as usize));
    }
    let len_octets = (first & 0x7F) as usize;
    if len_octets == 0 {
        return Err(Error::protocol("indefinite length not supported"));
    }
    if len_octets > 4 {
        return Err(Error::protocol(format!(
            "length encoding too large: {} octets",
            len_octets
        )));
    }
    if buf.len() < 2 + len_octets {
        return Ok(None);
    }
    let mut len = 0usize;
    for &b in &buf[2..2 + len_octets] {
        len = (len << 8) | b as usize;
    }
    Ok(Some(2 + len_octets + len))
}

/// Try to split one complete PDU off the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer holds only a partial PDU.
pub(crate) fn take_packet(buffer: &mut BytesMut) -> Result<Option<Packet>> {
    let total = match pdu_len(buffer)? {
        Some(n) => n,
        None => return Ok(None),
    };
    if total > MAX_PDU_LEN {
        return Err(Error::protocol(format!("PDU of {} bytes exceeds limit", total)));
    }
    if buffer.len() < total {
        return Ok(None);
    }
    let bytes = buffer.split_to(total).to_vec();
    Packet::from_bytes(bytes).map(Some)
}

/// Read one complete PDU from `stream`, buffering partial reads in `buffer`.
///
/// Returns `Ok(None)` when the peer closed the connection between PDUs.
/// An EOF in the middle of a PDU is a protocol error. When `read_timeout`
/// is set, each socket read must complete within it.
pub async fn read_packet<R>(
    stream: &mut R,
    buffer: &mut BytesMut,
    read_timeout: Option<std::time::Duration>,
) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(packet) = take_packet(buffer)? {
            return Ok(Some(packet));
        }
        let n = match read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, stream.read_buf(buffer))
                .await
                .map_err(|_| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    ))
                })??,
            None => stream.read_buf(buffer).await?,
        };
        if n == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(Error::protocol("connection closed mid-PDU"))
            };
        }
    }
}

/// Write one encoded PDU to `stream` and flush it.
pub async fn write_packet<W>(stream: &mut W, bytes: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Cursor-based reader for BER primitives.
pub struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    /// Bytes left in the underlying slice.
    pub fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    /// Current offset into the underlying slice. Combined with an element
    /// length this bounds the parse of nested lists.
    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        std::io::Read::read_exact(&mut self.cursor, &mut buf)
            .map_err(|_| Error::protocol("truncated BER element"))?;
        Ok(buf[0])
    }

    /// Read a single-byte tag.
    pub fn read_tag(&mut self) -> Result<u8> {
        self.read_byte()
    }

    /// Read a definite length (short or long form, at most 4 octets).
    pub fn read_length(&mut self) -> Result<usize> {
        let first = self.read_byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let len_octets = (first & 0x7F) as usize;
        if len_octets == 0 {
            return Err(Error::protocol("indefinite length not supported"));
        }
        if len_octets > 4 {
            return Err(Error::protocol(format!(
                "length encoding too large: {} octets",
                len_octets
            )));
        }
        if self.remaining() < len_octets {
            return Err(Error::protocol("truncated length encoding"));
        }
        let mut len = 0usize;
        for _ in 0..len_octets {
            len = (len << 8) | self.read_byte()? as usize;
        }
        Ok(len)
    }

    /// Read an INTEGER TLV as i32 with sign extension.
    pub fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_byte()?;
        if tag & 0x1F != 0x02 {
            return Err(Error::protocol(format!(
                "expected INTEGER (0x02), got 0x{:02X}",
                tag
            )));
        }
        let len = self.read_length()?;
        if len == 0 || len > 4 {
            return Err(Error::protocol(format!("integer of {} bytes", len)));
        }
        let bytes = self.read_raw(len)?;
        let mut value = 0i32;
        for &b in &bytes {
            value = (value << 8) | b as i32;
        }
        if len < 4 && bytes[0] & 0x80 != 0 {
            value |= !0 << (len * 8);
        }
        Ok(value)
    }

    /// Read an ENUMERATED TLV (single octet).
    pub fn read_enumerated(&mut self) -> Result<u8> {
        let tag = self.read_byte()?;
        if tag & 0x1F != 0x0A {
            return Err(Error::protocol(format!(
                "expected ENUMERATED (0x0A), got 0x{:02X}",
                tag
            )));
        }
        let len = self.read_length()?;
        if len != 1 {
            return Err(Error::protocol(format!("enumerated of {} bytes", len)));
        }
        self.read_byte()
    }

    /// Read a BOOLEAN TLV.
    pub fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_byte()?;
        if tag & 0x1F != 0x01 {
            return Err(Error::protocol(format!(
                "expected BOOLEAN (0x01), got 0x{:02X}",
                tag
            )));
        }
        let len = self.read_length()?;
        if len != 1 {
            return Err(Error::protocol(format!("boolean of {} bytes", len)));
        }
        Ok(self.read_byte()? != 0)
    }

    /// Read an OCTET STRING TLV. Context-specific tags in `0x80..=0xBF` are
    /// accepted since LDAP wraps many strings in IMPLICIT context tags.
    pub fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_byte()?;
        let ok = tag & 0x1F == 0x04 || tag == SEQUENCE_TAG || (0x80..=0xBF).contains(&tag);
        if !ok {
            return Err(Error::protocol(format!(
                "expected OCTET STRING (0x04), got 0x{:02X}",
                tag
            )));
        }
        self.read_octet_string_value()
    }

    /// Length + contents of an OCTET STRING whose tag was already consumed.
    pub fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length()?;
        self.read_raw(len)
    }

    /// Read an OCTET STRING and require UTF-8.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    /// Read a SEQUENCE header, returning the content length.
    pub fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_byte()?;
        if tag & 0x1F != 0x10 {
            return Err(Error::protocol(format!(
                "expected SEQUENCE (0x30), got 0x{:02X}",
                tag
            )));
        }
        self.read_length()
    }

    /// Read `n` raw bytes.
    pub fn read_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated value: need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; n];
        std::io::Read::read_exact(&mut self.cursor, &mut buf)
            .map_err(|_| Error::protocol("truncated value"))?;
        Ok(buf)
    }
}

/// Append-only BER writer. Lengths for nested structures are reserved and
/// back-patched once the content length is known.
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buffer.push(length as u8);
            return;
        }
        let mut octets = Vec::new();
        let mut len = length;
        while len > 0 {
            octets.push((len & 0xFF) as u8);
            len >>= 8;
        }
        octets.reverse();
        self.buffer.push(0x80 | octets.len() as u8);
        self.buffer.extend_from_slice(&octets);
    }

    /// Write an INTEGER TLV in minimal two's-complement form.
    pub fn write_integer(&mut self, value: i32) {
        self.write_tag(0x02);
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_length(4 - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(0x0A);
        self.write_length(1);
        self.buffer.push(value);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Write a context-specific IMPLICIT OCTET STRING `[n]`.
    pub fn write_context_string(&mut self, context_tag: u8, data: &[u8]) {
        self.write_tag(context_tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// Begin a universal SEQUENCE; pass the returned mark to [`Self::end`].
    pub fn start_sequence(&mut self) -> usize {
        self.write_tag(SEQUENCE_TAG);
        self.reserve_length()
    }

    /// Reserve one length octet after a tag written by the caller. Used for
    /// `[APPLICATION n]` IMPLICIT SEQUENCE bodies.
    pub fn reserve_length(&mut self) -> usize {
        let mark = self.buffer.len();
        self.buffer.push(0);
        mark
    }

    /// Back-patch the length octet reserved at `mark` to cover everything
    /// written since. Expands to long form when needed.
    pub fn end(&mut self, mark: usize) {
        let content_len = self.buffer.len() - (mark + 1);
        if content_len < 128 {
            self.buffer[mark] = content_len as u8;
            return;
        }
        let mut octets = Vec::new();
        let mut len = content_len;
        while len > 0 {
            octets.push((len & 0xFF) as u8);
            len >>= 8;
        }
        octets.reverse();
        self.buffer[mark] = 0x80 | octets.len() as u8;
        for (i, b) in octets.iter().enumerate() {
            self.buffer.insert(mark + 1 + i, *b);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}
