pub mod freedom;
pub mod shadowsocks;
pub mod socks;

use std::sync::Arc;
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::feature::Dispatcher;
use crate::net::{AsyncStream, Destination, Network, TargetAddr};
use crate::ray::OutboundRay;

/// Protocol logic for an accepted connection. Listening and connection
/// accounting live in the handler that wraps it.
#[async_trait::async_trait]
pub trait Inbound: Send + Sync {
    fn networks(&self) -> Vec<Network>;

    async fn process(
        &self,
        ctx: DispatchContext,
        stream: Box<dyn AsyncStream>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> crate::Result<()>;

    /// Packet-mode entry, driven for proxies whose `networks` include
    /// UDP. The default declines the network.
    async fn process_packets(
        &self,
        ctx: DispatchContext,
        socket: Arc<tokio::net::UdpSocket>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> crate::Result<()> {
        let _ = (ctx, socket, dispatcher);
        Err(PolyrayError::UnsupportedNetwork(Network::Udp))
    }
}

/// Protocol logic driving one ray toward an upstream.
#[async_trait::async_trait]
pub trait Outbound: Send + Sync {
    async fn process(
        &self,
        ctx: DispatchContext,
        ray: OutboundRay,
        dialer: Arc<dyn Dialer>,
    ) -> crate::Result<()>;
}

/// The transport contract outbound proxies dial through.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        ctx: &DispatchContext,
        dest: Destination,
    ) -> crate::Result<Box<dyn AsyncStream>>;
}

/// Plain TCP dialing, the bottom of every dialer chain.
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        _ctx: &DispatchContext,
        dest: Destination,
    ) -> crate::Result<Box<dyn AsyncStream>> {
        let stream = match &dest.addr {
            TargetAddr::SocketAddr(addr) => tokio::net::TcpStream::connect(addr).await?,
            TargetAddr::Domain(name, port) => {
                let addrs = tokio::net::lookup_host((name.as_str(), *port)).await?;
                let addr = addrs
                    .into_iter()
                    .next()
                    .ok_or(PolyrayError::Other(anyhow::anyhow!("Empty DNS response")))?;
                tokio::net::TcpStream::connect(addr).await?
            }
        };
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
