use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use crate::error::{MuxError, ShadowsocksError};
use crate::net::TargetAddr;

pub const ADDR_TYPE_IPV4: u8 = 1;
pub const ADDR_TYPE_DOMAIN: u8 = 3;
pub const ADDR_TYPE_IPV6: u8 = 4;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("unknown address type `{0}`")]
    UnknownType(u8),
    #[error("truncated address")]
    Truncated,
    #[error("domain name too long")]
    DomainTooLong,
}

impl From<AddressError> for ShadowsocksError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::UnknownType(t) => ShadowsocksError::InvalidAddressType(t),
            AddressError::Truncated => {
                ShadowsocksError::Io(std::io::ErrorKind::UnexpectedEof.into())
            }
            AddressError::DomainTooLong => {
                ShadowsocksError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "domain name too long",
                ))
            }
        }
    }
}

impl From<AddressError> for MuxError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::UnknownType(t) => MuxError::InvalidAddressType(t),
            _ => MuxError::TruncatedMetadata,
        }
    }
}

/// Appends `type | address | port_be` in the socks address form shared by
/// the shadowsocks request and mux frame targets.
pub fn append_address(out: &mut BytesMut, addr: &TargetAddr) -> Result<(), AddressError> {
    match addr {
        TargetAddr::SocketAddr(SocketAddr::V4(a)) => {
            out.put_u8(ADDR_TYPE_IPV4);
            out.put_slice(&a.ip().octets());
        }
        TargetAddr::SocketAddr(SocketAddr::V6(a)) => {
            out.put_u8(ADDR_TYPE_IPV6);
            out.put_slice(&a.ip().octets());
        }
        TargetAddr::Domain(domain, _) => {
            if domain.len() > u8::MAX as usize {
                return Err(AddressError::DomainTooLong);
            }
            out.put_u8(ADDR_TYPE_DOMAIN);
            out.put_u8(domain.len() as u8);
            out.put_slice(domain.as_bytes());
        }
    }
    out.put_u16(addr.port());
    Ok(())
}

/// Parses the form written by [`append_address`], advancing `buf`.
pub fn parse_address(buf: &mut BytesMut) -> Result<TargetAddr, AddressError> {
    if buf.remaining() < 1 {
        return Err(AddressError::Truncated);
    }
    let addr_type = buf.get_u8();

    let need = |buf: &BytesMut, n: usize| {
        if buf.remaining() < n {
            Err(AddressError::Truncated)
        } else {
            Ok(())
        }
    };

    match addr_type {
        ADDR_TYPE_IPV4 => {
            need(buf, 4 + 2)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(TargetAddr::SocketAddr(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            )))
        }
        ADDR_TYPE_IPV6 => {
            need(buf, 16 + 2)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(TargetAddr::SocketAddr(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        ADDR_TYPE_DOMAIN => {
            need(buf, 1)?;
            let len = buf.get_u8() as usize;
            need(buf, len + 2)?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            buf.advance(len);
            let port = buf.get_u16();
            Ok(TargetAddr::Domain(domain, port))
        }
        t => Err(AddressError::UnknownType(t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: TargetAddr) {
        let mut buf = BytesMut::new();
        append_address(&mut buf, &addr).unwrap();
        let parsed = parse_address(&mut buf).unwrap();
        assert_eq!(parsed, addr);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_all_address_forms() {
        roundtrip(TargetAddr::SocketAddr("1.2.3.4:80".parse().unwrap()));
        roundtrip(TargetAddr::SocketAddr("[2001:db8::1]:8443".parse().unwrap()));
        roundtrip(TargetAddr::Domain("example.com".into(), 443));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = BytesMut::from(&[0x07, 0, 0][..]);
        assert!(matches!(
            parse_address(&mut buf),
            Err(AddressError::UnknownType(0x07))
        ));
    }

    #[test]
    fn rejects_truncated_address() {
        let mut full = BytesMut::new();
        append_address(&mut full, &TargetAddr::Domain("example.com".into(), 443)).unwrap();
        let mut cut = BytesMut::from(&full[..full.len() - 3]);
        assert!(matches!(
            parse_address(&mut cut),
            Err(AddressError::Truncated)
        ));
    }
}
