//! The per-connection CAST5 stream contexts.
//!
//! The wire runs CAST5 in full-block CFB ("CFB64"), which makes the
//! keystream position part of the cipher state: byte `n` of a direction
//! only decrypts correctly if bytes `0..n` went through the same context
//! first. Each [`TqCipher`] therefore owns two buffered contexts, one per
//! direction, that survive arbitrary chunking of the stream.

use cast5::cipher::KeyIvInit;
use cast5::Cast5;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};

use crate::CryptoError;

type Enc = BufEncryptor<Cast5>;
type Dec = BufDecryptor<Cast5>;

const KEY_SIZE: usize = 16;
const IV_SIZE: usize = 8;

/// A symmetric cipher pair for one connection.
///
/// Constructed blank; [`TqCipher::generate_key`] is called once with the
/// bootstrap key on accept and once more with the session key after the
/// key exchange completes.
#[derive(Default)]
pub struct TqCipher {
    key: Option<[u8; KEY_SIZE]>,
    enc: Option<Enc>,
    dec: Option<Dec>,
}

impl TqCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or replaces the key for both directions and rewinds both
    /// keystreams to offset zero.
    ///
    /// CAST5 takes a 16-byte key: seeds of exactly that size are used
    /// as-is, anything else (the 64-byte derived session key) is folded
    /// through MD5 first.
    pub fn generate_key(&mut self, seed: &[u8]) {
        let mut key = [0u8; KEY_SIZE];
        if seed.len() == KEY_SIZE {
            key.copy_from_slice(seed);
        } else {
            key.copy_from_slice(&Md5::digest(seed));
        }
        self.key = Some(key);
        self.rewind(&key);
    }

    /// Rewinds both keystream offsets to zero without changing the key.
    pub fn reset(&mut self) {
        if let Some(key) = self.key {
            self.rewind(&key);
        }
    }

    fn rewind(&mut self, key: &[u8; KEY_SIZE]) {
        let iv = &key[..IV_SIZE];
        self.enc = Some(Enc::new_from_slices(key, iv).expect("CAST5 key/iv sizes are fixed"));
        self.dec = Some(Dec::new_from_slices(key, iv).expect("CAST5 key/iv sizes are fixed"));
    }

    /// True once a key has been generated.
    pub fn is_initialized(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypts `data` in place, advancing the outbound keystream.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.enc
            .as_mut()
            .ok_or(CryptoError::NotInitialized)?
            .encrypt(data);
        Ok(())
    }

    /// Decrypts `data` in place, advancing the inbound keystream.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.dec
            .as_mut()
            .ok_or(CryptoError::NotInitialized)?
            .decrypt(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::BOOTSTRAP_KEY;

    #[test]
    fn uninitialized_cipher_refuses_work() {
        let mut c = TqCipher::new();
        assert!(!c.is_initialized());
        assert_eq!(c.encrypt(&mut [0u8; 4]), Err(CryptoError::NotInitialized));
        assert_eq!(c.decrypt(&mut [0u8; 4]), Err(CryptoError::NotInitialized));
    }

    #[test]
    fn round_trip_is_chunking_invariant() {
        let plain: Vec<u8> = (0..=255).collect();

        // One context encrypts in a single call, the peer decrypts the
        // stream in ragged chunks. The offsets must line up regardless.
        let mut sender = TqCipher::new();
        sender.generate_key(BOOTSTRAP_KEY);
        let mut wire = plain.clone();
        sender.encrypt(&mut wire).unwrap();

        let mut receiver = TqCipher::new();
        receiver.generate_key(BOOTSTRAP_KEY);
        for chunk in wire.chunks_mut(7) {
            receiver.decrypt(chunk).unwrap();
        }
        assert_eq!(wire, plain);
    }

    #[test]
    fn directions_have_independent_offsets() {
        let mut a = TqCipher::new();
        let mut b = TqCipher::new();
        a.generate_key(BOOTSTRAP_KEY);
        b.generate_key(BOOTSTRAP_KEY);

        // Interleave directions: a's outbound stream must not disturb its
        // inbound stream.
        let mut out1 = *b"attack at dawn!!";
        a.encrypt(&mut out1).unwrap();

        let mut in1 = *b"fall back west!!";
        b.encrypt(&mut in1).unwrap();
        a.decrypt(&mut in1).unwrap();
        assert_eq!(&in1, b"fall back west!!");

        b.decrypt(&mut out1).unwrap();
        assert_eq!(&out1, b"attack at dawn!!");
    }

    #[test]
    fn reset_rewinds_both_offsets() {
        let mut sender = TqCipher::new();
        let mut receiver = TqCipher::new();
        sender.generate_key(BOOTSTRAP_KEY);
        receiver.generate_key(BOOTSTRAP_KEY);

        let mut first = *b"0123456789abcdef";
        sender.encrypt(&mut first).unwrap();

        sender.reset();
        let mut second = *b"0123456789abcdef";
        sender.encrypt(&mut second).unwrap();

        // Identical plaintext from a rewound stream yields identical
        // ciphertext, and the receiver at offset zero reads it back.
        assert_eq!(first, second);
        receiver.decrypt(&mut second).unwrap();
        assert_eq!(&second, b"0123456789abcdef");
    }

    #[test]
    fn rekey_invalidates_prior_material() {
        let mut sender = TqCipher::new();
        sender.generate_key(BOOTSTRAP_KEY);
        let mut wire = *b"secret handshake";
        sender.encrypt(&mut wire).unwrap();

        let mut receiver = TqCipher::new();
        receiver.generate_key(&[0x5A; 64]);
        receiver.decrypt(&mut wire).unwrap();
        assert_ne!(&wire, b"secret handshake");
    }

    #[test]
    fn long_seed_is_folded() {
        let mut a = TqCipher::new();
        a.generate_key(&[0x11; 64]);
        assert!(a.is_initialized());

        let mut b = TqCipher::new();
        b.generate_key(&[0x11; 64]);

        let mut wire = *b"same key derived";
        a.encrypt(&mut wire).unwrap();
        b.decrypt(&mut wire).unwrap();
        assert_eq!(&wire, b"same key derived");
    }
}
