use std::io;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::buffer::{self, MultiBuffer, Reader, TransferType, Writer};
use crate::crypto::auth::Authenticator;
use crate::error::CryptoError;

pub trait ChunkSizeEncoder: Send {
    fn size_bytes(&self) -> usize;
    fn encode(&self, size: u16, out: &mut BytesMut);
}

pub trait ChunkSizeDecoder: Send {
    fn size_bytes(&self) -> usize;
    fn decode(&self, data: &[u8]) -> io::Result<u16>;
}

/// Big-endian u16 size prefix.
#[derive(Clone, Copy, Default)]
pub struct PlainChunkSizeParser;

impl ChunkSizeEncoder for PlainChunkSizeParser {
    fn size_bytes(&self) -> usize {
        2
    }

    fn encode(&self, size: u16, out: &mut BytesMut) {
        out.put_u16(size);
    }
}

impl ChunkSizeDecoder for PlainChunkSizeParser {
    fn size_bytes(&self) -> usize {
        2
    }

    fn decode(&self, data: &[u8]) -> io::Result<u16> {
        if data.len() < 2 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }
}

fn crypto_err(e: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Unsealed size-prefixed chunk stream. A zero-size frame marks the end.
pub struct ChunkStreamWriter<S, W> {
    size_parser: S,
    writer: W,
}

impl<S: ChunkSizeEncoder, W: AsyncWrite + Unpin + Send> ChunkStreamWriter<S, W> {
    pub fn new(size_parser: S, writer: W) -> Self {
        Self { size_parser, writer }
    }
}

#[async_trait::async_trait]
impl<S: ChunkSizeEncoder, W: AsyncWrite + Unpin + Send> Writer for ChunkStreamWriter<S, W> {
    async fn write_multi_buffer(&mut self, mut mb: MultiBuffer) -> io::Result<()> {
        let mut out = BytesMut::new();
        loop {
            let chunk = mb.read_bytes(u16::MAX as usize);
            self.size_parser.encode(chunk.len() as u16, &mut out);
            out.extend_from_slice(&chunk);
            if mb.is_empty() {
                break;
            }
        }
        self.writer.write_all(&out).await?;
        self.writer.flush().await
    }
}

pub struct ChunkStreamReader<S, R> {
    size_parser: S,
    reader: R,
}

impl<S: ChunkSizeDecoder, R: AsyncRead + Unpin + Send> ChunkStreamReader<S, R> {
    pub fn new(size_parser: S, reader: R) -> Self {
        Self { size_parser, reader }
    }
}

#[async_trait::async_trait]
impl<S: ChunkSizeDecoder, R: AsyncRead + Unpin + Send> Reader for ChunkStreamReader<S, R> {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        let mut size_buf = vec![0u8; self.size_parser.size_bytes()];
        self.reader.read_exact(&mut size_buf).await?;
        let size = self.size_parser.decode(&size_buf)? as usize;
        if size == 0 {
            return Ok(None);
        }

        let mut payload = vec![0u8; size];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(MultiBuffer::from(&payload[..])))
    }
}

/// Sealed size-prefixed chunk stream. Each frame is
/// `size | sealed(payload)`; a frame whose size equals the authenticator
/// overhead carries an empty payload and marks the end of stream.
pub struct AuthenticationWriter<S, W> {
    auth: Box<dyn Authenticator>,
    size_parser: S,
    writer: W,
    transfer: TransferType,
}

impl<S: ChunkSizeEncoder, W: AsyncWrite + Unpin + Send> AuthenticationWriter<S, W> {
    pub fn new(
        auth: Box<dyn Authenticator>,
        size_parser: S,
        writer: W,
        transfer: TransferType,
    ) -> Self {
        Self { auth, size_parser, writer, transfer }
    }

    fn seal(&mut self, chunk: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let sealed = self.auth.seal(chunk).map_err(crypto_err)?;
        self.size_parser.encode(sealed.len() as u16, out);
        out.extend_from_slice(&sealed);
        Ok(())
    }

    async fn write_stream(&mut self, mut mb: MultiBuffer) -> io::Result<()> {
        let payload_size = buffer::SIZE - self.auth.overhead() - self.size_parser.size_bytes();
        let mut out = BytesMut::new();
        loop {
            let chunk = mb.read_bytes(payload_size);
            self.seal(&chunk, &mut out)?;
            if mb.is_empty() {
                break;
            }
        }
        self.writer.write_all(&out).await?;
        self.writer.flush().await
    }

    async fn write_packet(&mut self, mut mb: MultiBuffer) -> io::Result<()> {
        let mut out = BytesMut::new();
        loop {
            let chunk = mb.split_first().unwrap_or_default();
            self.seal(&chunk, &mut out)?;
            if mb.is_empty() {
                break;
            }
        }
        self.writer.write_all(&out).await?;
        self.writer.flush().await
    }
}

#[async_trait::async_trait]
impl<S: ChunkSizeEncoder, W: AsyncWrite + Unpin + Send> Writer for AuthenticationWriter<S, W> {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> io::Result<()> {
        match self.transfer {
            TransferType::Stream => self.write_stream(mb).await,
            TransferType::Packet => self.write_packet(mb).await,
        }
    }
}

pub struct AuthenticationReader<S, R> {
    auth: Box<dyn Authenticator>,
    size_parser: S,
    reader: R,
}

impl<S: ChunkSizeDecoder, R: AsyncRead + Unpin + Send> AuthenticationReader<S, R> {
    pub fn new(auth: Box<dyn Authenticator>, size_parser: S, reader: R) -> Self {
        Self { auth, size_parser, reader }
    }
}

#[async_trait::async_trait]
impl<S: ChunkSizeDecoder, R: AsyncRead + Unpin + Send> Reader for AuthenticationReader<S, R> {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        let mut size_buf = vec![0u8; self.size_parser.size_bytes()];
        self.reader.read_exact(&mut size_buf).await?;
        let size = self.size_parser.decode(&size_buf)? as usize;

        if size == self.auth.overhead() {
            return Ok(None);
        }

        let mut sealed = vec![0u8; size];
        self.reader.read_exact(&mut sealed).await?;
        let plain = self.auth.open(&sealed).map_err(crypto_err)?;
        Ok(Some(MultiBuffer::from(&plain[..])))
    }
}
