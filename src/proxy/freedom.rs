use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use crate::buffer::{copy, IoReader, IoWriter, MultiBuffer};
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::net::{Destination, Network, TargetAddr};
use crate::proxy::{Dialer, Outbound};
use crate::ray::{OutboundRay, PipeReader, PipeWriter};

/// Direct connection to the target, no re-encoding. UDP targets get a
/// connected socket relaying one datagram per buffer.
pub struct FreedomOutbound;

#[async_trait::async_trait]
impl Outbound for FreedomOutbound {
    async fn process(
        &self,
        ctx: DispatchContext,
        ray: OutboundRay,
        dialer: Arc<dyn Dialer>,
    ) -> crate::Result<()> {
        let dest = ctx.target.clone().ok_or(PolyrayError::NoTarget)?;
        tracing::info!("Connecting to `{}`", dest);

        if dest.network == Network::Udp {
            return relay_datagrams(ctx, dest, ray).await;
        }

        let stream = dialer.dial(&ctx, dest).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let OutboundRay { mut input, mut output } = ray;

        let request = async {
            let mut write_half = write_half;
            let result = copy(&mut input, &mut IoWriter::new(&mut write_half), None).await;
            let _ = write_half.shutdown().await;
            result
        };

        let response = async {
            copy(&mut IoReader::new(read_half), &mut output, None).await?;
            output.close();
            Ok(())
        };

        tokio::try_join!(request, response)?;
        Ok(())
    }
}

async fn send_datagrams(mut input: PipeReader, socket: Arc<UdpSocket>) -> std::io::Result<()> {
    while let Some(mut mb) = input.read().await? {
        while let Some(datagram) = mb.split_first() {
            if datagram.is_empty() {
                continue;
            }
            socket.send(&datagram).await?;
        }
    }
    Ok(())
}

async fn recv_datagrams(socket: Arc<UdpSocket>, output: PipeWriter) -> std::io::Result<()> {
    let mut buf = vec![0u8; crate::buffer::SIZE];
    loop {
        let n = socket.recv(&mut buf).await?;
        output.write(MultiBuffer::from(&buf[..n])).await?;
    }
}

async fn relay_datagrams(
    ctx: DispatchContext,
    dest: Destination,
    ray: OutboundRay,
) -> crate::Result<()> {
    let addr = match &dest.addr {
        TargetAddr::SocketAddr(addr) => *addr,
        TargetAddr::Domain(name, port) => tokio::net::lookup_host((name.as_str(), *port))
            .await?
            .next()
            .ok_or(PolyrayError::Other(anyhow::anyhow!("Empty DNS response")))?,
    };

    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    let socket = Arc::new(socket);

    let OutboundRay { input, output } = ray;
    let result = tokio::select! {
        r = send_datagrams(input, socket.clone()) => r,
        r = recv_datagrams(socket.clone(), output) => r,
        _ = ctx.cancel.cancelled() => Ok(()),
    };
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MultiBuffer;
    use crate::net::{Destination, TargetAddr};
    use crate::proxy::TcpDialer;
    use crate::ray::new_ray;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_directions_to_the_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Upper-casing echo peer.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            let upper: Vec<u8> = buf[..n].iter().map(u8::to_ascii_uppercase).collect();
            socket.write_all(&upper).await.unwrap();
        });

        let (inbound, outbound) = new_ray();
        let ctx = DispatchContext::with_target(Destination::tcp(TargetAddr::SocketAddr(addr)));
        let task = tokio::spawn(async move {
            FreedomOutbound
                .process(ctx, outbound, Arc::new(TcpDialer))
                .await
        });

        inbound.input.write(MultiBuffer::from(&b"hello"[..])).await.unwrap();
        inbound.input.close();

        let mut inbound = inbound;
        let mut got = Vec::new();
        while let Some(mb) = inbound.output.read().await.unwrap() {
            got.extend_from_slice(&mb.to_bytes());
        }
        assert_eq!(got, b"HELLO");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn relays_datagrams_for_udp_targets() {
        let origin = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (n, peer) = origin.recv_from(&mut buf).await.unwrap();
            origin.send_to(&buf[..n], peer).await.unwrap();
        });

        let (inbound, outbound) = new_ray();
        let ctx = DispatchContext::with_target(Destination::udp(TargetAddr::SocketAddr(
            origin_addr,
        )));
        let task = tokio::spawn(async move {
            FreedomOutbound
                .process(ctx, outbound, Arc::new(TcpDialer))
                .await
        });

        inbound.input.write(MultiBuffer::from(&b"dgram"[..])).await.unwrap();
        let mut inbound = inbound;
        let mb = inbound.output.read().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"dgram");

        inbound.input.close();
        task.await.unwrap().unwrap();
    }
}
