use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use crate::error::PolyrayError;

pub type Result<T> = std::result::Result<T, PolyrayError>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum TargetAddr {
    SocketAddr(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::SocketAddr(a) => a.port(),
            TargetAddr::Domain(_, p) => *p,
        }
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::SocketAddr(a) => write!(f, "{}", a),
            TargetAddr::Domain(d, p) => write!(f, "{}:{}", d, p),
        }
    }
}

impl From<fast_socks5::util::target_addr::TargetAddr> for TargetAddr {
    fn from(value: fast_socks5::util::target_addr::TargetAddr) -> Self {
        match value {
            fast_socks5::util::target_addr::TargetAddr::Ip(a) => Self::SocketAddr(a),
            fast_socks5::util::target_addr::TargetAddr::Domain(d, p) => Self::Domain(d, p),
        }
    }
}

/// Where a logical stream is headed, including the transport network.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Destination {
    pub network: Network,
    pub addr: TargetAddr,
}

impl Destination {
    pub fn tcp(addr: TargetAddr) -> Self {
        Self { network: Network::Tcp, addr }
    }

    pub fn udp(addr: TargetAddr) -> Self {
        Self { network: Network::Udp, addr }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.addr)
    }
}

pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AsyncStream for T {}
