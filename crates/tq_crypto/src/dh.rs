//! The Diffie-Hellman exchange that negotiates the per-session cipher key.
//!
//! The server opens every connection by sending its public key inside a
//! loosely framed blob (junk padding, `u32`-length-prefixed ASCII-hex
//! records for the modulus, generator, and public key, and the usual
//! trailing `"TQServer"` signature but no leading length header). The
//! client answers with its own public key in a similarly self-describing
//! blob, and both ends fold the shared secret into a 64-byte ASCII
//! session key.

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use num_bigint::BigUint;
use rand::Rng;
use tq_protocol::SERVER_SIGNATURE;

use crate::CryptoError;

/// Fixed 256-bit modulus, kept as the ASCII hex the wire carries.
pub const DH_PRIME: &str = "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2F";

/// Fixed generator, also as wire ASCII.
pub const DH_GENERATOR: &str = "05";

/// Bytes of reserved space opening both key-exchange blobs.
const RESERVED_LEN: usize = 11;

/// Junk padding inside the server blob.
const JUNK_LEN: usize = 12;

/// Length of the derived session key: two concatenated 32-char hex
/// digests as ASCII.
pub const SESSION_KEY_LEN: usize = 64;

/// One connection's side of the exchange. Holds the ephemeral private
/// exponent, so it lives exactly as long as the handshake.
pub struct DhExchange {
    prime: BigUint,
    generator: BigUint,
    private_key: BigUint,
    public_key: BigUint,
    shared_secret: Option<BigUint>,
}

impl DhExchange {
    pub fn new() -> Self {
        let prime = parse_hex(DH_PRIME).expect("modulus constant is valid hex");
        let generator = parse_hex(DH_GENERATOR).expect("generator constant is valid hex");

        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed[..]);
        let mut private_key = BigUint::from_bytes_be(&seed) % &prime;
        if private_key < BigUint::from(2u8) {
            private_key += 2u8;
        }
        let public_key = generator.modpow(&private_key, &prime);

        Self {
            prime,
            generator,
            private_key,
            public_key,
            shared_secret: None,
        }
    }

    /// This side's public key as uppercase ASCII hex.
    pub fn public_key_hex(&self) -> String {
        to_hex(&self.public_key)
    }

    /// Serializes the server's opening blob. The layout is part of the
    /// wire contract: reserved bytes, a `u32` payload size covering
    /// everything after itself up to the signature, a junk record, then
    /// the P/G/A records, each a `u32` length and ASCII bytes.
    pub fn create_key_exchange_packet(&self) -> Bytes {
        let mut rng = rand::thread_rng();
        let mut buf = BytesMut::with_capacity(256);

        let mut reserved = [0u8; RESERVED_LEN];
        rng.fill(&mut reserved[..]);
        buf.put_slice(&reserved);

        let size_at = buf.len();
        buf.put_u32_le(0);

        let mut junk = [0u8; JUNK_LEN];
        rng.fill(&mut junk[..]);
        buf.put_u32_le(JUNK_LEN as u32);
        buf.put_slice(&junk);

        for record in [DH_PRIME, DH_GENERATOR, self.public_key_hex().as_str()] {
            buf.put_u32_le(record.len() as u32);
            buf.put_slice(record.as_bytes());
        }

        let payload_size = (buf.len() - size_at - 4) as u32;
        buf[size_at..size_at + 4].copy_from_slice(&payload_size.to_le_bytes());

        buf.put_slice(SERVER_SIGNATURE);
        buf.freeze()
    }

    /// Accepts the client's public key (ASCII hex) and computes the
    /// shared secret.
    pub fn handle_client_response(&mut self, public_key_hex: &str) -> Result<(), CryptoError> {
        let public = parse_hex(public_key_hex)
            .ok_or_else(|| CryptoError::BadDhResponse("public key is not hex".into()))?;
        if public.bits() == 0 || public >= self.prime {
            return Err(CryptoError::BadDhResponse(
                "public key outside the group".into(),
            ));
        }
        self.shared_secret = Some(public.modpow(&self.private_key, &self.prime));
        Ok(())
    }

    /// Folds the shared secret into the 64-byte session key:
    /// `s1 = hex(md5(secret bytes up to the first zero))`,
    /// `s2 = hex(md5(s1 || s1))`, key = ASCII of `s1 || s2`.
    pub fn derive_session_key(&self) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
        let secret = self
            .shared_secret
            .as_ref()
            .ok_or_else(|| CryptoError::BadDhResponse("no client response yet".into()))?;

        let s_bytes = secret.to_bytes_be();
        let cut = s_bytes.iter().position(|&b| b == 0).unwrap_or(s_bytes.len());

        let s1 = digest_hex(&s_bytes[..cut]);
        let s2 = digest_hex(format!("{s1}{s1}").as_bytes());

        let mut key = [0u8; SESSION_KEY_LEN];
        key[..32].copy_from_slice(s1.as_bytes());
        key[32..].copy_from_slice(s2.as_bytes());
        Ok(key)
    }
}

impl Default for DhExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// The P/G/A records carried by a server key-exchange blob.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DhParams {
    pub prime: String,
    pub generator: String,
    pub server_public_key: String,
}

/// Parses a server key-exchange blob (signature included). The inverse of
/// [`DhExchange::create_key_exchange_packet`]; the server itself never
/// consumes one, but connection tooling and the test client do.
pub fn parse_key_exchange_packet(blob: &[u8]) -> Result<DhParams, CryptoError> {
    let malformed = |what: &str| CryptoError::BadDhResponse(what.into());

    let body = blob
        .strip_suffix(SERVER_SIGNATURE)
        .ok_or_else(|| malformed("missing signature"))?;

    let mut pos = RESERVED_LEN;
    let mut read_u32 = |pos: &mut usize| -> Result<u32, CryptoError> {
        let raw: [u8; 4] = body
            .get(*pos..*pos + 4)
            .ok_or_else(|| malformed("truncated record length"))?
            .try_into()
            .expect("slice length is four");
        *pos += 4;
        Ok(u32::from_le_bytes(raw))
    };

    let payload_size = read_u32(&mut pos)? as usize;
    if body.len() - pos != payload_size {
        return Err(malformed("payload size mismatch"));
    }

    let mut read_record = |pos: &mut usize| -> Result<String, CryptoError> {
        let len = read_u32(pos)? as usize;
        let raw = body
            .get(*pos..*pos + len)
            .ok_or_else(|| malformed("truncated record"))?;
        *pos += len;
        Ok(String::from_utf8_lossy(raw).into_owned())
    };

    let _junk = read_record(&mut pos)?;
    let prime = read_record(&mut pos)?;
    let generator = read_record(&mut pos)?;
    let server_public_key = read_record(&mut pos)?;

    Ok(DhParams {
        prime,
        generator,
        server_public_key,
    })
}

/// Serializes a client response blob carrying `public_key_hex`. The
/// server only ever parses these (`Packet::try_extract_dh_key`); the
/// builder exists for the client side of tests and tooling.
pub fn build_client_response(public_key_hex: &str) -> Bytes {
    let mut rng = rand::thread_rng();
    let mut buf = BytesMut::with_capacity(128);

    let mut reserved = [0u8; RESERVED_LEN];
    rng.fill(&mut reserved[..]);
    buf.put_slice(&reserved);

    let mut junk = [0u8; JUNK_LEN];
    rng.fill(&mut junk[..]);
    buf.put_u32_le(JUNK_LEN as u32);
    buf.put_slice(&junk);

    buf.put_u32_le(public_key_hex.len() as u32);
    buf.put_slice(public_key_hex.as_bytes());
    buf.freeze()
}

fn parse_hex(hex: &str) -> Option<BigUint> {
    BigUint::parse_bytes(hex.as_bytes(), 16)
}

fn to_hex(n: &BigUint) -> String {
    n.to_str_radix(16).to_uppercase()
}

fn digest_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Md5::digest(bytes);
    let mut out = String::with_capacity(32);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}
