//! A minimal protocol client for exercising the server end to end.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, ensure, Context as _};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tq_crypto::dh::{build_client_response, parse_key_exchange_packet};
use tq_crypto::{DhExchange, TqCipher, BOOTSTRAP_KEY};
use tq_protocol::{CodecError, FrameDecoder, Packet, PacketType, CLIENT_SIGNATURE};

pub(crate) struct TestClient {
    stream: TcpStream,
    cipher: TqCipher,
    decoder: FrameDecoder,
}

impl TestClient {
    pub(crate) async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut cipher = TqCipher::new();
        cipher.generate_key(BOOTSTRAP_KEY);
        Ok(Self {
            stream,
            cipher,
            decoder: FrameDecoder::new(),
        })
    }

    /// Runs the client side of the three-phase handshake: receive the
    /// server's key-exchange blob, answer with a dummy frame and our own
    /// public key, then switch both cipher directions to the session key.
    pub(crate) async fn handshake(&mut self) -> anyhow::Result<()> {
        let mut blob = BytesMut::new();
        let params = loop {
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .context("key exchange timed out")??;
            ensure!(n > 0, "server closed during key exchange");

            let mut piece = chunk[..n].to_vec();
            self.cipher.decrypt(&mut piece)?;
            blob.extend_from_slice(&piece);

            if let Ok(params) = parse_key_exchange_packet(&blob) {
                break params;
            }
            ensure!(blob.len() < 4096, "runaway key exchange blob");
        };

        // The dummy frame travels in the clear.
        let mut dummy = vec![0u8; 16];
        dummy[..2].copy_from_slice(&16u16.to_le_bytes());
        self.stream.write_all(&dummy).await?;

        let mut exchange = DhExchange::new();
        let response = build_client_response(&exchange.public_key_hex());
        let mut wire = response.to_vec();
        self.cipher.encrypt(&mut wire)?;
        self.stream.write_all(&wire).await?;

        exchange.handle_client_response(&params.server_public_key)?;
        let session_key = exchange.derive_session_key()?;
        self.cipher.generate_key(&session_key);
        self.cipher.reset();
        Ok(())
    }

    /// Builds, signs (`"TQClient"`), encrypts, and sends one frame.
    pub(crate) async fn send_frame(
        &mut self,
        ty: PacketType,
        write: impl FnOnce(&mut Packet) -> Result<(), CodecError>,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::build(ty);
        write(&mut packet)?;
        let wire = packet.finalize_with(CLIENT_SIGNATURE);
        self.send_encrypted(&wire).await
    }

    /// Encrypts arbitrary bytes under the current cipher and sends them.
    pub(crate) async fn send_encrypted(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut wire = bytes.to_vec();
        self.cipher.encrypt(&mut wire)?;
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Sends raw plaintext bytes, bypassing the cipher.
    pub(crate) async fn send_plaintext(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Receives and decrypts the next server frame.
    pub(crate) async fn recv_frame(&mut self) -> anyhow::Result<Packet> {
        loop {
            if let Some(frame) = self.decoder.next_frame(|b| {
                let _ = self.cipher.decrypt(b);
            })? {
                ensure!(frame.is_server_packet(), "frame without server signature");
                return Ok(frame);
            }

            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .context("recv timed out")??;
            ensure!(n > 0, "connection closed while awaiting a frame");
            self.decoder.queue_slice(&chunk[..n]);
        }
    }

    /// Succeeds once the server closes the connection within `within`.
    pub(crate) async fn expect_close(&mut self, within: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + within;
        let mut chunk = [0u8; 1024];
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                bail!("server did not close the connection within {within:?}");
            }
            match tokio::time::timeout(deadline - now, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Ok(()),
                Err(_) => bail!("server did not close the connection within {within:?}"),
            }
        }
    }
}
