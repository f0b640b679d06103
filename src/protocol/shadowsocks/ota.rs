use std::io;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use crate::buffer::{BufferedReader, MultiBuffer, Reader, Writer};

/// Truncated HMAC-SHA1 length for the one-time-auth scheme.
pub const AUTH_SIZE: usize = 10;

pub fn authenticate(key: &[u8], data: &[u8]) -> [u8; AUTH_SIZE] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; AUTH_SIZE];
    out.copy_from_slice(&digest[..AUTH_SIZE]);
    out
}

/// MAC key for the request header: `iv ‖ key`.
pub fn header_key(key: &[u8], iv: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(iv.len() + key.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(key);
    out
}

/// Per-chunk MAC keys: `iv ‖ chunk_id_be32`, counting from zero.
pub struct ChunkKeySource {
    iv: Vec<u8>,
    chunk_id: u32,
}

impl ChunkKeySource {
    pub fn new(iv: Vec<u8>) -> Self {
        Self { iv, chunk_id: 0 }
    }

    fn next_key(&mut self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.iv.len() + 4);
        key.extend_from_slice(&self.iv);
        key.extend_from_slice(&self.chunk_id.to_be_bytes());
        self.chunk_id += 1;
        key
    }
}

fn invalid_ota() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "invalid OTA")
}

/// Reads `u16 len | mac | payload` chunks, verifying each MAC.
pub struct ChunkReader<R> {
    inner: BufferedReader<R>,
    keys: ChunkKeySource,
}

impl<R: Reader> ChunkReader<R> {
    pub fn new(inner: BufferedReader<R>, keys: ChunkKeySource) -> Self {
        Self { inner, keys }
    }
}

#[async_trait::async_trait]
impl<R: Reader> Reader for ChunkReader<R> {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        if self.inner.at_eof().await? {
            return Ok(None);
        }
        let len = self.inner.read_u16().await? as usize;
        if len < AUTH_SIZE {
            return Err(invalid_ota());
        }
        let mut chunk = self.inner.read_exact(len).await?;
        let payload = chunk.split_off(AUTH_SIZE);
        let expected = authenticate(&self.keys.next_key(), &payload);
        if chunk[..] != expected {
            return Err(invalid_ota());
        }
        Ok(Some(MultiBuffer::from(payload)))
    }
}

/// Writes `u16 len | mac | payload` chunks, one per input buffer.
pub struct ChunkWriter<W> {
    inner: W,
    keys: ChunkKeySource,
}

impl<W: Writer> ChunkWriter<W> {
    pub fn new(inner: W, keys: ChunkKeySource) -> Self {
        Self { inner, keys }
    }
}

#[async_trait::async_trait]
impl<W: Writer> Writer for ChunkWriter<W> {
    async fn write_multi_buffer(&mut self, mut mb: MultiBuffer) -> io::Result<()> {
        let mut out = BytesMut::new();
        while let Some(payload) = mb.split_first() {
            if payload.is_empty() {
                continue;
            }
            let mac = authenticate(&self.keys.next_key(), &payload);
            out.extend_from_slice(&((AUTH_SIZE + payload.len()) as u16).to_be_bytes());
            out.extend_from_slice(&mac);
            out.extend_from_slice(&payload);
        }
        if out.is_empty() {
            return Ok(());
        }
        self.inner.write_multi_buffer(MultiBuffer::from(out)).await
    }
}
