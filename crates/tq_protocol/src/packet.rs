//! Owned packet frames with a cursor-based read/write API.

use bytes::{Bytes, BytesMut};

use crate::{
    CodecError, PacketType, CLIENT_SIGNATURE, HEADER_SIZE, MAX_PACKET_SIZE, SERVER_SIGNATURE,
    SIGNATURE_SIZE,
};

/// Maximum number of data bytes (header + payload) a frame may carry. The
/// signature occupies the rest of the [`MAX_PACKET_SIZE`] budget.
pub const MAX_DATA_SIZE: usize = MAX_PACKET_SIZE - SIGNATURE_SIZE;

/// An owned frame buffer.
///
/// A `Packet` is either *parsed* from received bytes (in which case reads
/// are bounded by the declared length) or *built* from scratch and later
/// sealed with [`Packet::finalize`], which patches the header and appends
/// the `"TQServer"` signature.
#[derive(Clone, Debug)]
pub struct Packet {
    buf: BytesMut,
    pos: usize,
    /// One past the last readable/written byte, excluding any signature.
    end: usize,
}

impl Packet {
    /// Starts building an outbound frame of the given type.
    pub fn build(ty: PacketType) -> Self {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&ty.0.to_le_bytes());
        Self {
            buf,
            pos: HEADER_SIZE,
            end: HEADER_SIZE,
        }
    }

    /// Wraps a complete received frame (`declared_length + 8` bytes).
    ///
    /// The cursor starts at the beginning of the payload and reads are
    /// bounded by the declared length. The signature is *not* validated
    /// here; use [`Packet::is_complete`].
    pub fn from_frame(buf: BytesMut) -> Result<Self, CodecError> {
        if buf.len() < MIN_FRAME {
            return Err(CodecError::FrameTooSmall { size: buf.len() });
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(CodecError::FrameTooLarge { size: buf.len() });
        }
        let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if declared < HEADER_SIZE {
            return Err(CodecError::FrameTooSmall {
                size: declared + SIGNATURE_SIZE,
            });
        }
        if buf.len() < declared + SIGNATURE_SIZE {
            return Err(CodecError::DeclaredLengthMismatch {
                declared,
                available: buf.len(),
            });
        }
        Ok(Self {
            buf,
            pos: HEADER_SIZE,
            end: declared,
        })
    }

    /// Wraps an unframed blob (no header, no declared length). Reads are
    /// bounded by the blob length. Used for the key-exchange payloads that
    /// bypass normal framing.
    pub fn from_raw(buf: BytesMut) -> Self {
        let end = buf.len();
        Self { buf, pos: 0, end }
    }

    /// Declared data length: header + payload, signature excluded.
    pub fn declared_length(&self) -> usize {
        if self.buf.len() < 2 {
            return 0;
        }
        u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize
    }

    /// The wire type of this frame.
    pub fn packet_type(&self) -> PacketType {
        if self.buf.len() < HEADER_SIZE {
            return PacketType(0);
        }
        PacketType(u16::from_le_bytes([self.buf[2], self.buf[3]]))
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.end.saturating_sub(HEADER_SIZE)
    }

    /// Whether the buffer holds an entire well-signed frame: a sane
    /// declared length, enough bytes to cover it plus the signature, and a
    /// known signature in the trailing position.
    pub fn is_complete(&self) -> bool {
        let declared = self.declared_length();
        declared >= HEADER_SIZE
            && self.buf.len() >= declared + SIGNATURE_SIZE
            && (self.signature() == Some(CLIENT_SIGNATURE) || self.signature() == Some(SERVER_SIGNATURE))
    }

    pub fn is_client_packet(&self) -> bool {
        self.signature() == Some(CLIENT_SIGNATURE)
    }

    pub fn is_server_packet(&self) -> bool {
        self.signature() == Some(SERVER_SIGNATURE)
    }

    fn signature(&self) -> Option<&[u8; SIGNATURE_SIZE]> {
        let declared = self.declared_length();
        let sig = self.buf.get(declared..declared + SIGNATURE_SIZE)?;
        sig.try_into().ok()
    }

    /// Current cursor offset from the start of the frame.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the cursor to an absolute offset within the data bound.
    pub fn seek(&mut self, pos: usize) -> Result<(), CodecError> {
        if pos > self.read_limit() {
            return Err(CodecError::OutOfBounds {
                pos,
                len: 0,
                limit: self.read_limit(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Advances the cursor without reading.
    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.seek(self.pos + n)
    }

    /// Moves the cursor to an offset relative to the payload start.
    pub fn seek_to_payload(&mut self, offset: usize) -> Result<(), CodecError> {
        self.seek(HEADER_SIZE + offset)
    }

    fn read_limit(&self) -> usize {
        self.end
    }

    fn check_read(&self, len: usize) -> Result<(), CodecError> {
        if self.pos + len > self.end {
            return Err(CodecError::OutOfBounds {
                pos: self.pos,
                len,
                limit: self.end,
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.check_read(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.check_read(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Reads `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        self.check_read(n)?;
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Reads a fixed-width string field, truncating at the first NUL.
    /// Invalid UTF-8 is replaced rather than rejected; field contents are
    /// client-controlled and only ever logged or compared.
    pub fn read_string(&mut self, width: usize) -> Result<String, CodecError> {
        let raw = self.read_bytes(width)?;
        let cut = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..cut]).into_owned())
    }

    fn check_write(&self, len: usize) -> Result<(), CodecError> {
        if self.pos + len > MAX_DATA_SIZE {
            return Err(CodecError::Overflow {
                pos: self.pos,
                len,
                max: MAX_DATA_SIZE,
            });
        }
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.check_write(bytes.len())?;
        let needed = self.pos + bytes.len();
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }
        self.buf[self.pos..needed].copy_from_slice(bytes);
        self.pos = needed;
        self.end = self.end.max(needed);
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.put(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<(), CodecError> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.put(bytes)
    }

    /// Writes a string into a fixed-width field, NUL-padded.
    pub fn write_string(&mut self, s: &str, width: usize) -> Result<(), CodecError> {
        if s.len() > width {
            return Err(CodecError::Overflow {
                pos: self.pos,
                len: s.len(),
                max: width,
            });
        }
        let mut field = vec![0u8; width];
        field[..s.len()].copy_from_slice(s.as_bytes());
        self.put(&field)
    }

    /// Seals an outbound frame: patches the declared length over the
    /// placeholder, appends the `"TQServer"` signature, and hands back the
    /// wire bytes.
    pub fn finalize(self) -> Bytes {
        self.finalize_with(SERVER_SIGNATURE)
    }

    /// [`Packet::finalize`] with an explicit signature; the client side
    /// of the protocol seals frames with `"TQClient"`.
    pub fn finalize_with(mut self, signature: &[u8; SIGNATURE_SIZE]) -> Bytes {
        let declared = self.end as u16;
        self.buf[0..2].copy_from_slice(&declared.to_le_bytes());
        self.buf.truncate(self.end);
        self.buf.extend_from_slice(signature);
        self.buf.freeze()
    }

    /// Attempts to pull the client's public key out of a key-exchange
    /// blob. The blob self-describes its layout: an `i32` at offset 11
    /// gives the junk-padding length, the key record (`i32` size + ASCII
    /// bytes) follows the padding. Any bound violation restores the cursor
    /// and yields `None`.
    pub fn try_extract_dh_key(&mut self) -> Option<String> {
        let saved = self.pos;
        match self.extract_dh_key_inner() {
            Ok(key) => Some(key),
            Err(_) => {
                self.pos = saved;
                None
            }
        }
    }

    fn extract_dh_key_inner(&mut self) -> Result<String, CodecError> {
        self.seek(11)?;
        let junk_len = self.read_i32()?;
        if junk_len < 0 {
            return Err(CodecError::OutOfBounds {
                pos: self.pos,
                len: 0,
                limit: self.end,
            });
        }
        self.seek(junk_len as usize + 4 + 11)?;
        let key_size = self.read_i32()?;
        if key_size <= 0 {
            return Err(CodecError::OutOfBounds {
                pos: self.pos,
                len: 0,
                limit: self.end,
            });
        }
        let raw = self.read_bytes(key_size as usize)?;
        if !raw.is_ascii() {
            return Err(CodecError::BadSignature);
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// The underlying frame bytes (header + payload, no signature for
    /// built packets; the full received buffer for parsed ones).
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

const MIN_FRAME: usize = HEADER_SIZE + SIGNATURE_SIZE;
