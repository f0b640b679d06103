use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};
use crate::buffer::{MultiBuffer, Reader, Writer};

const PIPE_CAPACITY: usize = 32;

fn err_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "pipe closed with error")
}

#[derive(Debug)]
struct Shared {
    err: CancellationToken,
    eof: CancellationToken,
}

/// Writing half of a one-way pipe. Clonable so several producers can feed
/// one stream (the mux frame writer relies on this).
#[derive(Clone, Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<MultiBuffer>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub async fn write(&self, mb: MultiBuffer) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.shared.err.cancelled() => Err(err_closed()),
            _ = self.shared.eof.cancelled() => Err(io::ErrorKind::BrokenPipe.into()),
            res = self.tx.send(mb) => res.map_err(|_| io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Signals EOF to the reading side once queued buffers are consumed.
    pub fn close(&self) {
        self.shared.eof.cancel();
    }

    /// Aborts the pipe; the reader observes an error even with data queued.
    pub fn close_error(&self) {
        self.shared.err.cancel();
    }

    pub fn controller(&self) -> PipeController {
        PipeController { shared: self.shared.clone() }
    }
}

#[async_trait::async_trait]
impl Writer for PipeWriter {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> io::Result<()> {
        self.write(mb).await
    }
}

/// Reading half of a one-way pipe.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<MultiBuffer>,
    shared: Arc<Shared>,
}

impl PipeReader {
    pub async fn read(&mut self) -> io::Result<Option<MultiBuffer>> {
        tokio::select! {
            biased;
            _ = self.shared.err.cancelled() => Err(err_closed()),
            m = self.rx.recv() => Ok(m),
            _ = self.shared.eof.cancelled() => Ok(self.rx.try_recv().ok()),
        }
    }

    pub fn close(&self) {
        self.shared.eof.cancel();
    }

    pub fn close_error(&self) {
        self.shared.err.cancel();
    }

    pub fn controller(&self) -> PipeController {
        PipeController { shared: self.shared.clone() }
    }
}

#[async_trait::async_trait]
impl Reader for PipeReader {
    async fn read_multi_buffer(&mut self) -> io::Result<Option<MultiBuffer>> {
        self.read().await
    }
}

/// Detached close handle for a pipe, usable after its endpoint moved away.
#[derive(Clone)]
pub struct PipeController {
    shared: Arc<Shared>,
}

impl PipeController {
    pub fn close(&self) {
        self.shared.eof.cancel();
    }

    pub fn close_error(&self) {
        self.shared.err.cancel();
    }
}

pub fn new_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    let shared = Arc::new(Shared {
        err: CancellationToken::new(),
        eof: CancellationToken::new(),
    });
    (
        PipeWriter { tx, shared: shared.clone() },
        PipeReader { rx, shared },
    )
}

/// The view of a ray held by the side that accepted the connection.
#[derive(Debug)]
pub struct InboundRay {
    pub input: PipeWriter,
    pub output: PipeReader,
}

/// The view of a ray handed to an outbound handler.
#[derive(Debug)]
pub struct OutboundRay {
    pub input: PipeReader,
    pub output: PipeWriter,
}

/// Builds the bidirectional pipe for one dispatched connection.
pub fn new_ray() -> (InboundRay, OutboundRay) {
    let (in_writer, in_reader) = new_pipe();
    let (out_writer, out_reader) = new_pipe();
    (
        InboundRay { input: in_writer, output: out_reader },
        OutboundRay { input: in_reader, output: out_writer },
    )
}

/// `AsyncRead`/`AsyncWrite` over the inbound half of a ray, used when an
/// outbound handler dials through another handler instead of a socket.
pub struct RayStream {
    tx: PollSender<MultiBuffer>,
    rx: mpsc::Receiver<MultiBuffer>,
    leftover: MultiBuffer,
    input_ctl: PipeController,
    read_err: Pin<Box<WaitForCancellationFutureOwned>>,
    write_err: Pin<Box<WaitForCancellationFutureOwned>>,
    read_eof: Pin<Box<WaitForCancellationFutureOwned>>,
    broken: bool,
    read_done: bool,
}

impl From<InboundRay> for RayStream {
    fn from(ray: InboundRay) -> Self {
        let InboundRay { input, output } = ray;
        Self {
            input_ctl: input.controller(),
            read_err: Box::pin(output.shared.err.clone().cancelled_owned()),
            read_eof: Box::pin(output.shared.eof.clone().cancelled_owned()),
            write_err: Box::pin(input.shared.err.clone().cancelled_owned()),
            tx: PollSender::new(input.tx.clone()),
            rx: output.rx,
            leftover: MultiBuffer::new(),
            broken: false,
            read_done: false,
        }
    }
}

impl AsyncRead for RayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.leftover.is_empty() {
                let chunk = this.leftover.read_bytes(buf.remaining());
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }
            if this.broken || this.read_err.as_mut().poll(cx).is_ready() {
                this.broken = true;
                return Poll::Ready(Err(err_closed()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(mb)) => {
                    this.leftover = mb;
                }
                Poll::Ready(None) => {
                    this.read_done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => {
                    // An explicit close with live writer clones shows up on
                    // the eof token rather than as a closed channel.
                    if this.read_eof.as_mut().poll(cx).is_ready() {
                        this.read_done = true;
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for RayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.broken {
            return Poll::Ready(Err(err_closed()));
        }
        if this.write_err.as_mut().poll(cx).is_ready() {
            this.broken = true;
            return Poll::Ready(Err(err_closed()));
        }
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let mb = MultiBuffer::from(buf);
                if this.tx.send_item(mb).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.input_ctl.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn preserves_byte_order_within_direction() {
        let (writer, mut reader) = new_pipe();

        let feeder = tokio::spawn(async move {
            for i in 0..100u8 {
                let mut mb = MultiBuffer::new();
                mb.append(BytesMut::from(&[i][..]));
                writer.write(mb).await.unwrap();
            }
            writer.close();
        });

        let mut seen = Vec::new();
        while let Some(mb) = reader.read().await.unwrap() {
            seen.extend_from_slice(&mb.to_bytes());
        }
        feeder.await.unwrap();

        let expected: Vec<u8> = (0..100).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn close_delivers_queued_data_before_eof() {
        let (writer, mut reader) = new_pipe();
        writer.write(MultiBuffer::from(&b"tail"[..])).await.unwrap();
        writer.close();

        let mb = reader.read().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"tail");
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_close_is_distinct_from_eof() {
        let (writer, mut reader) = new_pipe();
        writer.write(MultiBuffer::from(&b"x"[..])).await.unwrap();
        writer.close_error();

        let err = reader.read().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        // Writers observe the abort as well.
        let err = writer.write(MultiBuffer::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let (writer, _reader) = new_pipe();
        writer.close();
        let err = writer.write(MultiBuffer::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn ray_stream_bridges_both_directions() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (inbound, mut outbound) = new_ray();
        let mut stream = RayStream::from(inbound);

        stream.write_all(b"ping").await.unwrap();
        let mb = outbound.input.read().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"ping");

        outbound.output.write(MultiBuffer::from(&b"pong"[..])).await.unwrap();
        outbound.output.close();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
    }
}
