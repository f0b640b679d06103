use std::collections::VecDeque;
use std::io;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::signal::ActivityTimer;

/// Capacity of a single buffer moved through a ray.
pub const SIZE: usize = 2 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Stream,
    Packet,
}

/// An ordered run of buffers moved as one unit. Consuming reads drain
/// front buffers; releasing is dropping.
#[derive(Debug, Default)]
pub struct MultiBuffer {
    bufs: VecDeque<BytesMut>,
}

impl MultiBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, buf: BytesMut) {
        self.bufs.push_back(buf);
    }

    pub fn extend(&mut self, mut other: MultiBuffer) {
        self.bufs.append(&mut other.bufs);
    }

    pub fn split_first(&mut self) -> Option<BytesMut> {
        self.bufs.pop_front()
    }

    /// Total payload bytes across all buffers.
    pub fn len(&self) -> usize {
        self.bufs.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.iter().all(|b| b.is_empty())
    }

    /// Drains up to `limit` bytes from the front into one contiguous buffer.
    pub fn read_bytes(&mut self, limit: usize) -> BytesMut {
        let mut out = BytesMut::with_capacity(limit.min(self.len()));
        while out.len() < limit {
            let Some(mut front) = self.bufs.pop_front() else {
                break;
            };
            let want = limit - out.len();
            if front.len() > want {
                out.extend_from_slice(&front.split_to(want));
                self.bufs.push_front(front);
            } else {
                out.extend_from_slice(&front);
            }
        }
        out
    }

    /// Concatenated copy of the content. Test and logging helper.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for b in &self.bufs {
            out.extend_from_slice(b);
        }
        out.freeze()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &BytesMut> {
        self.bufs.iter()
    }
}

impl From<BytesMut> for MultiBuffer {
    fn from(buf: BytesMut) -> Self {
        let mut mb = MultiBuffer::new();
        mb.append(buf);
        mb
    }
}

impl From<&[u8]> for MultiBuffer {
    fn from(data: &[u8]) -> Self {
        MultiBuffer::from(BytesMut::from(data))
    }
}

/// Source of `MultiBuffer`s. `Ok(None)` is end of stream.
#[async_trait::async_trait]
pub trait Reader: Send {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>>;
}

impl std::fmt::Debug for dyn Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Reader").finish_non_exhaustive()
    }
}

/// Sink of `MultiBuffer`s with backpressure.
#[async_trait::async_trait]
pub trait Writer: Send {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> io::Result<()>;
}

#[async_trait::async_trait]
impl<R: Reader + ?Sized> Reader for Box<R> {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        (**self).read_multi_buffer().await
    }
}

#[async_trait::async_trait]
impl<W: Writer + ?Sized> Writer for Box<W> {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> io::Result<()> {
        (**self).write_multi_buffer(mb).await
    }
}

/// Adapts a raw byte source to a `Reader`.
pub struct IoReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> IoReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> Reader for IoReader<R> {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        let mut buf = BytesMut::with_capacity(SIZE);
        let n = self.inner.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(MultiBuffer::from(buf)))
    }
}

/// Adapts a raw byte sink to a `Writer`.
pub struct IoWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> IoWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> Writer for IoWriter<W> {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> io::Result<()> {
        for buf in mb.buffers() {
            self.inner.write_all(buf).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

/// Moves buffers from `reader` to `writer` until EOF, stamping the shared
/// inactivity timer on every successful move.
pub async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: Option<&ActivityTimer>,
) -> io::Result<()>
where
    R: Reader + ?Sized,
    W: Writer + ?Sized,
{
    while let Some(mb) = reader.read_multi_buffer().await? {
        writer.write_multi_buffer(mb).await?;
        if let Some(timer) = activity {
            timer.update();
        }
    }
    Ok(())
}

/// Byte-granular view over a `Reader`, keeping unconsumed leftovers.
pub struct BufferedReader<R> {
    inner: R,
    buffer: MultiBuffer,
    eof: bool,
}

impl<R: Reader> BufferedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: MultiBuffer::new(),
            eof: false,
        }
    }

    async fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.inner.read_multi_buffer().await? {
            Some(mb) => {
                self.buffer.extend(mb);
                Ok(true)
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> io::Result<BytesMut> {
        while self.buffer.len() < n {
            if !self.fill().await? {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(self.buffer.read_bytes(n))
    }

    pub async fn read_u16(&mut self) -> io::Result<u16> {
        let b = self.read_exact(2).await?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub async fn drain(&mut self, n: usize) -> io::Result<()> {
        self.read_exact(n).await.map(|_| ())
    }

    /// True once the underlying stream hit EOF with no leftovers pending.
    pub async fn at_eof(&mut self) -> io::Result<bool> {
        while self.buffer.is_empty() {
            if !self.fill().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait::async_trait]
impl<R: Reader> Reader for BufferedReader<R> {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        if !self.buffer.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        if self.eof {
            return Ok(None);
        }
        self.inner.read_multi_buffer().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bytes_crosses_buffer_boundaries() {
        let mut mb = MultiBuffer::new();
        mb.append(BytesMut::from(&b"abc"[..]));
        mb.append(BytesMut::from(&b"defg"[..]));

        let first = mb.read_bytes(5);
        assert_eq!(&first[..], b"abcde");
        assert_eq!(mb.len(), 2);

        let rest = mb.read_bytes(100);
        assert_eq!(&rest[..], b"fg");
        assert!(mb.is_empty());
    }

    #[tokio::test]
    async fn io_roundtrip_preserves_order() {
        let (client, server) = tokio::io::duplex(64);
        let (read_half, _keep) = tokio::io::split(server);
        let (_discard, write_half) = tokio::io::split(client);

        let mut writer = IoWriter::new(write_half);
        let mut payload = MultiBuffer::new();
        payload.append(BytesMut::from(&b"hello "[..]));
        payload.append(BytesMut::from(&b"world"[..]));
        writer.write_multi_buffer(payload).await.unwrap();
        drop(writer);

        let mut reader = BufferedReader::new(IoReader::new(read_half));
        let got = reader.read_exact(11).await.unwrap();
        assert_eq!(&got[..], b"hello world");
    }
}
