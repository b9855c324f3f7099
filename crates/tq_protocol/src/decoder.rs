//! Incremental frame extraction from a raw socket stream.
//!
//! The decoder keeps two buffers: `raw` holds bytes exactly as received
//! (possibly ciphertext) and `scratch` holds bytes that have been run
//! through the connection's inbound cipher. Decryption is performed lazily,
//! only for the bytes the frame in progress needs, so a cipher swap midway
//! through the stream (the post-handshake rekey) never double-processes
//! queued bytes.

use bytes::BytesMut;

use crate::{
    packet::Packet, CodecError, HEADER_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, SIGNATURE_SIZE,
};

/// Streaming decoder for one connection's inbound byte stream.
#[derive(Default)]
pub struct FrameDecoder {
    raw: BytesMut,
    scratch: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes straight off the socket.
    pub fn queue_slice(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    /// Total bytes buffered and not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.raw.len() + self.scratch.len()
    }

    /// Attempts to consume the plaintext dummy frame that opens the
    /// handshake: a `u16` length followed by that many bytes in total.
    /// Returns the consumed length, or `None` until enough bytes arrive.
    pub fn next_dummy(&mut self) -> Result<Option<usize>, CodecError> {
        if self.raw.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_le_bytes([self.raw[0], self.raw[1]]) as usize;
        if len > MAX_PACKET_SIZE {
            return Err(CodecError::FrameTooLarge { size: len });
        }
        if len < MIN_PACKET_SIZE {
            return Err(CodecError::FrameTooSmall { size: len });
        }
        if self.raw.len() < len {
            return Ok(None);
        }
        let _ = self.raw.split_to(len);
        Ok(Some(len))
    }

    /// Attempts to extract one complete frame, decrypting exactly the
    /// bytes it spans with `decrypt`. Returns `Ok(None)` until the frame
    /// is whole.
    pub fn next_frame(
        &mut self,
        mut decrypt: impl FnMut(&mut [u8]),
    ) -> Result<Option<Packet>, CodecError> {
        if self.scratch.len() < 2 {
            self.fill_scratch(2, &mut decrypt);
            if self.scratch.len() < 2 {
                return Ok(None);
            }
        }

        let declared = u16::from_le_bytes([self.scratch[0], self.scratch[1]]) as usize;
        let total = declared + SIGNATURE_SIZE;
        if total > MAX_PACKET_SIZE {
            return Err(CodecError::FrameTooLarge { size: total });
        }
        if total < MIN_PACKET_SIZE || declared < HEADER_SIZE {
            return Err(CodecError::FrameTooSmall { size: total });
        }

        if self.scratch.len() < total {
            self.fill_scratch(total, &mut decrypt);
            if self.scratch.len() < total {
                return Ok(None);
            }
        }

        let frame = self.scratch.split_to(total);
        Packet::from_frame(frame).map(Some)
    }

    /// Attempts to extract the client's key-exchange blob, decrypting
    /// exactly the bytes it spans. The blob self-describes its length
    /// (reserved bytes, an `i32` junk length, the junk, an `i32` key
    /// size, the key), so trailing bytes are left untouched in the raw
    /// buffer. A first game frame pipelined behind the response is
    /// encrypted under the not-yet-installed session key and must not go
    /// through this cipher.
    pub fn next_key_blob(
        &mut self,
        mut decrypt: impl FnMut(&mut [u8]),
    ) -> Result<Option<BytesMut>, CodecError> {
        const PREFIX: usize = 11 + 4;

        self.fill_scratch(PREFIX, &mut decrypt);
        if self.scratch.len() < PREFIX {
            return Ok(None);
        }
        let junk_len = self.read_i32_at(11);
        if junk_len < 0 || junk_len as usize > MAX_PACKET_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: junk_len.unsigned_abs() as usize,
            });
        }

        let key_at = PREFIX + junk_len as usize;
        self.fill_scratch(key_at + 4, &mut decrypt);
        if self.scratch.len() < key_at + 4 {
            return Ok(None);
        }
        let key_size = self.read_i32_at(key_at);
        if key_size <= 0 || key_size as usize > MAX_PACKET_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: key_size.unsigned_abs() as usize,
            });
        }

        let total = key_at + 4 + key_size as usize;
        if total > MAX_PACKET_SIZE {
            return Err(CodecError::FrameTooLarge { size: total });
        }
        self.fill_scratch(total, &mut decrypt);
        if self.scratch.len() < total {
            return Ok(None);
        }
        Ok(Some(self.scratch.split_to(total)))
    }

    fn read_i32_at(&self, at: usize) -> i32 {
        i32::from_le_bytes([
            self.scratch[at],
            self.scratch[at + 1],
            self.scratch[at + 2],
            self.scratch[at + 3],
        ])
    }

    /// Moves up to `target - scratch.len()` bytes from `raw` into
    /// `scratch`, decrypting them on the way.
    fn fill_scratch(&mut self, target: usize, decrypt: &mut impl FnMut(&mut [u8])) {
        let have = self.scratch.len();
        if have >= target {
            return;
        }
        let take = (target - have).min(self.raw.len());
        if take == 0 {
            return;
        }
        let mut chunk = self.raw.split_to(take);
        decrypt(&mut chunk);
        self.scratch.unsplit(chunk);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::PacketType;

    fn no_crypt(_: &mut [u8]) {}

    fn sample_frame(payload: &[u8]) -> Bytes {
        let mut p = Packet::build(PacketType::C_MSG_TALK);
        p.write_bytes(payload).unwrap();
        p.finalize()
    }

    #[test]
    fn frame_across_split_deliveries() {
        let wire = sample_frame(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut dec = FrameDecoder::new();

        for chunk in wire.chunks(3) {
            dec.queue_slice(chunk);
        }
        let got = dec.next_frame(no_crypt).unwrap().unwrap();
        assert_eq!(got.payload_len(), 8);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn partial_frame_returns_none() {
        let wire = sample_frame(&[0; 16]);
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&wire[..5]);
        assert!(dec.next_frame(no_crypt).unwrap().is_none());
        dec.queue_slice(&wire[5..]);
        assert!(dec.next_frame(no_crypt).unwrap().is_some());
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_frame(&[1; 4]);
        let b = sample_frame(&[2; 6]);
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&a);
        dec.queue_slice(&b);

        assert_eq!(dec.next_frame(no_crypt).unwrap().unwrap().payload_len(), 4);
        assert_eq!(dec.next_frame(no_crypt).unwrap().unwrap().payload_len(), 6);
        assert!(dec.next_frame(no_crypt).unwrap().is_none());
    }

    #[test]
    fn oversize_declared_length_is_fatal() {
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&2000u16.to_le_bytes());
        assert!(matches!(
            dec.next_frame(no_crypt),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn undersize_declared_length_is_fatal() {
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&1u16.to_le_bytes());
        assert!(matches!(
            dec.next_frame(no_crypt),
            Err(CodecError::FrameTooSmall { .. })
        ));
    }

    #[test]
    fn dummy_frame_consumed_without_decryption() {
        let mut dec = FrameDecoder::new();
        let mut dummy = vec![0u8; 32];
        dummy[..2].copy_from_slice(&32u16.to_le_bytes());
        dec.queue_slice(&dummy);
        dec.queue_slice(&[0xEE; 4]);

        assert_eq!(dec.next_dummy().unwrap(), Some(32));
        assert_eq!(dec.buffered(), 4);
    }

    #[test]
    fn dummy_frame_length_is_validated() {
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&3u16.to_le_bytes());
        assert!(matches!(
            dec.next_dummy(),
            Err(CodecError::FrameTooSmall { .. })
        ));
    }

    fn key_blob(junk: &[u8], key: &[u8]) -> Vec<u8> {
        let mut blob = vec![0u8; 11];
        blob.extend_from_slice(&(junk.len() as i32).to_le_bytes());
        blob.extend_from_slice(junk);
        blob.extend_from_slice(&(key.len() as i32).to_le_bytes());
        blob.extend_from_slice(key);
        blob
    }

    #[test]
    fn key_blob_reassembles_across_reads() {
        let blob = key_blob(&[0xAA; 7], b"C0FFEE");
        let mut dec = FrameDecoder::new();

        dec.queue_slice(&blob[..13]);
        assert!(dec.next_key_blob(no_crypt).unwrap().is_none());
        dec.queue_slice(&blob[13..]);

        let got = dec.next_key_blob(no_crypt).unwrap().unwrap();
        assert_eq!(&got[..], &blob[..]);
    }

    #[test]
    fn key_blob_leaves_trailing_bytes_untouched() {
        // The inverting "cipher" must only touch the blob's own bytes;
        // a pipelined tail stays raw for the next cipher to handle.
        let blob = key_blob(&[0x11; 4], b"ABCDEF");
        let inverted: Vec<u8> = blob.iter().map(|b| !b).collect();

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&inverted);
        dec.queue_slice(&[0x77; 12]);

        let got = dec
            .next_key_blob(|c| c.iter_mut().for_each(|b| *b = !*b))
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], &blob[..]);
        assert_eq!(dec.buffered(), 12);
    }

    #[test]
    fn key_blob_with_runaway_lengths_is_fatal() {
        let mut blob = vec![0u8; 11];
        blob.extend_from_slice(&4096i32.to_le_bytes());
        let mut dec = FrameDecoder::new();
        dec.queue_slice(&blob);
        assert!(matches!(
            dec.next_key_blob(no_crypt),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn decrypt_is_applied_once_per_byte() {
        // "Decryption" that flips every byte; applying it twice would undo
        // itself and the assertion below would catch the corruption.
        let wire = sample_frame(&[0x0F; 4]);
        let flipped: Vec<u8> = wire.iter().map(|b| !b).collect();

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&flipped[..3]);
        assert!(dec
            .next_frame(|c| c.iter_mut().for_each(|b| *b = !*b))
            .unwrap()
            .is_none());
        dec.queue_slice(&flipped[3..]);
        let got = dec
            .next_frame(|c| c.iter_mut().for_each(|b| *b = !*b))
            .unwrap()
            .unwrap();
        assert!(got.is_complete());
        assert_eq!(got.packet_type(), PacketType::C_MSG_TALK);
    }
}
