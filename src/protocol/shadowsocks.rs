pub mod cipher;
pub mod ota;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bytes::BytesMut;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::buffer::{BufferedReader, MultiBuffer, Reader, Writer};
use crate::net::{Destination, TargetAddr};
use crate::protocol::socks_addr;
use crate::error::ShadowsocksError;
pub use cipher::CipherKind;
use ota::{ChunkKeySource, AUTH_SIZE};

type Result<T> = std::result::Result<T, ShadowsocksError>;

pub const VERSION: u8 = 1;

const OTA_FLAG: u8 = 0x10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestOption(u8);

impl RequestOption {
    pub const ONE_TIME_AUTH: RequestOption = RequestOption(0x01);

    pub fn has(&self, other: RequestOption) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: RequestOption) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: RequestOption) {
        self.0 &= !other.0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestCommand {
    Tcp,
    Udp,
}

#[derive(Clone, Debug)]
pub struct RequestHeader {
    pub version: u8,
    pub command: RequestCommand,
    pub address: TargetAddr,
    pub option: RequestOption,
}

impl RequestHeader {
    pub fn destination(&self) -> Destination {
        match self.command {
            RequestCommand::Tcp => Destination::tcp(self.address.clone()),
            RequestCommand::Udp => Destination::udp(self.address.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtaPolicy {
    Enabled,
    Disabled,
    Auto,
}

pub struct MemoryAccount {
    pub cipher: CipherKind,
    pub key: Vec<u8>,
    pub one_time_auth: OtaPolicy,
}

impl MemoryAccount {
    pub fn new(password: &str, cipher: CipherKind, one_time_auth: OtaPolicy) -> Self {
        let key = cipher::password_to_key(password, cipher.key_size());
        Self { cipher, key, one_time_auth }
    }

    /// Whether a client using this account stamps one-time auth. AEAD
    /// ciphers carry their own integrity and never use it.
    pub fn wants_one_time_auth(&self) -> bool {
        !self.cipher.is_aead() && !matches!(self.one_time_auth, OtaPolicy::Disabled)
    }
}

fn check_ota_policy(option: RequestOption, account: &MemoryAccount) -> Result<()> {
    let flagged = option.has(RequestOption::ONE_TIME_AUTH);
    if flagged && account.one_time_auth == OtaPolicy::Disabled {
        return Err(ShadowsocksError::OtaForbidden);
    }
    if !flagged && account.one_time_auth == OtaPolicy::Enabled {
        return Err(ShadowsocksError::OtaRequired);
    }
    Ok(())
}

fn random_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Reads a TCP request header off an accepted connection and returns it
/// together with the payload reader (chunk-authenticated when OTA is on).
pub async fn read_tcp_session<R>(
    account: &MemoryAccount,
    mut reader: R,
) -> Result<(RequestHeader, Box<dyn Reader>)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let iv_len = account.cipher.iv_size();
    let mut iv = vec![0u8; iv_len];
    if iv_len > 0 {
        reader.read_exact(&mut iv).await?;
    }

    let plain = account.cipher.new_decryption_reader(&account.key, &iv, reader)?;
    let mut br = BufferedReader::new(plain);

    // Raw header bytes accumulate here for the OTA MAC.
    let mut header = BytesMut::new();
    header.extend_from_slice(&br.read_exact(1).await?);

    let mut option = RequestOption::default();
    if !account.cipher.is_aead() {
        if header[0] & OTA_FLAG == OTA_FLAG {
            option.set(RequestOption::ONE_TIME_AUTH);
        }
        check_ota_policy(option, account)?;
    }

    let addr_type = header[0] & 0x0F;
    let mut address: Option<TargetAddr> = None;
    match addr_type {
        socks_addr::ADDR_TYPE_IPV4 => {
            let raw = br.read_exact(4).await?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&raw);
            header.extend_from_slice(&raw);
            address = Some(TargetAddr::SocketAddr(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                0,
            )));
        }
        socks_addr::ADDR_TYPE_IPV6 => {
            let raw = br.read_exact(16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw);
            header.extend_from_slice(&raw);
            address = Some(TargetAddr::SocketAddr(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                0,
            )));
        }
        socks_addr::ADDR_TYPE_DOMAIN => {
            let len_raw = br.read_exact(1).await?;
            let len = len_raw[0] as usize;
            header.extend_from_slice(&len_raw);
            let raw = br.read_exact(len).await?;
            let domain = String::from_utf8_lossy(&raw).to_string();
            header.extend_from_slice(&raw);
            address = Some(TargetAddr::Domain(domain, 0));
        }
        _ => {
            // Address validity is judged after OTA verification.
        }
    }

    let port_raw = br.read_exact(2).await?;
    let port = u16::from_be_bytes([port_raw[0], port_raw[1]]);
    header.extend_from_slice(&port_raw);

    if option.has(RequestOption::ONE_TIME_AUTH) {
        let expected = ota::authenticate(&ota::header_key(&account.key, &iv), &header);
        let actual = br.read_exact(AUTH_SIZE).await?;
        if actual[..] != expected {
            return Err(ShadowsocksError::InvalidOta);
        }
    }

    let address = match address {
        Some(TargetAddr::SocketAddr(mut a)) => {
            a.set_port(port);
            TargetAddr::SocketAddr(a)
        }
        Some(TargetAddr::Domain(d, _)) => TargetAddr::Domain(d, port),
        None => return Err(ShadowsocksError::MissingAddress),
    };

    let request = RequestHeader {
        version: VERSION,
        command: RequestCommand::Tcp,
        address,
        option,
    };

    let body: Box<dyn Reader> = if option.has(RequestOption::ONE_TIME_AUTH) {
        Box::new(ota::ChunkReader::new(br, ChunkKeySource::new(iv)))
    } else {
        Box::new(br)
    };
    Ok((request, body))
}

/// Writes a TCP request header and returns the payload writer.
pub async fn write_tcp_request<W>(
    account: &MemoryAccount,
    request: &mut RequestHeader,
    mut writer: W,
) -> Result<Box<dyn Writer>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    if account.cipher.is_aead() {
        request.option.clear(RequestOption::ONE_TIME_AUTH);
    }

    let iv = random_iv(account.cipher.iv_size());
    if !iv.is_empty() {
        writer.write_all(&iv).await?;
    }

    let mut enc = account.cipher.new_encryption_writer(&account.key, &iv, writer)?;

    let mut header = BytesMut::new();
    socks_addr::append_address(&mut header, &request.address)?;

    if request.option.has(RequestOption::ONE_TIME_AUTH) {
        header[0] |= OTA_FLAG;
        let mac = ota::authenticate(&ota::header_key(&account.key, &iv), &header);
        header.extend_from_slice(&mac);
    }

    enc.write_multi_buffer(MultiBuffer::from(header)).await?;

    let body: Box<dyn Writer> = if request.option.has(RequestOption::ONE_TIME_AUTH) {
        Box::new(ota::ChunkWriter::new(enc, ChunkKeySource::new(iv)))
    } else {
        Box::new(enc)
    };
    Ok(body)
}

pub async fn read_tcp_response<R>(
    account: &MemoryAccount,
    mut reader: R,
) -> Result<Box<dyn Reader>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let iv_len = account.cipher.iv_size();
    let mut iv = vec![0u8; iv_len];
    if iv_len > 0 {
        reader.read_exact(&mut iv).await?;
    }
    Ok(account.cipher.new_decryption_reader(&account.key, &iv, reader)?)
}

pub async fn write_tcp_response<W>(
    account: &MemoryAccount,
    mut writer: W,
) -> Result<Box<dyn Writer>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let iv = random_iv(account.cipher.iv_size());
    if !iv.is_empty() {
        writer.write_all(&iv).await?;
    }
    Ok(account.cipher.new_encryption_writer(&account.key, &iv, writer)?)
}

/// Encodes one UDP datagram: `iv | addr | payload | [mac]`, encrypted in
/// place by the account cipher.
pub fn encode_udp_packet(
    account: &MemoryAccount,
    request: &RequestHeader,
    payload: &[u8],
) -> Result<BytesMut> {
    let iv_len = account.cipher.iv_size();
    let iv = random_iv(iv_len);

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&iv);
    socks_addr::append_address(&mut buf, &request.address)?;
    buf.extend_from_slice(payload);

    if !account.cipher.is_aead() && request.option.has(RequestOption::ONE_TIME_AUTH) {
        buf[iv_len] |= OTA_FLAG;
        let mac = ota::authenticate(&ota::header_key(&account.key, &iv), &buf[iv_len..]);
        buf.extend_from_slice(&mac);
    }

    account.cipher.encode_packet(&account.key, &mut buf)?;
    Ok(buf)
}

/// Decodes one UDP datagram into its request header and payload.
pub fn decode_udp_packet(
    account: &MemoryAccount,
    mut payload: BytesMut,
) -> Result<(RequestHeader, BytesMut)> {
    let mut iv = Vec::new();
    if !account.cipher.is_aead() && account.cipher.iv_size() > 0 {
        if payload.len() < account.cipher.iv_size() {
            return Err(ShadowsocksError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        iv.extend_from_slice(&payload[..account.cipher.iv_size()]);
    }

    account.cipher.decode_packet(&account.key, &mut payload)?;

    if payload.is_empty() {
        return Err(ShadowsocksError::Io(io::ErrorKind::UnexpectedEof.into()));
    }

    let mut option = RequestOption::default();
    if !account.cipher.is_aead() {
        if payload[0] & OTA_FLAG == OTA_FLAG {
            option.set(RequestOption::ONE_TIME_AUTH);
        }
        check_ota_policy(option, account)?;

        if option.has(RequestOption::ONE_TIME_AUTH) {
            if payload.len() < AUTH_SIZE {
                return Err(ShadowsocksError::InvalidOta);
            }
            let body_len = payload.len() - AUTH_SIZE;
            let expected =
                ota::authenticate(&ota::header_key(&account.key, &iv), &payload[..body_len]);
            if payload[body_len..] != expected {
                return Err(ShadowsocksError::InvalidOta);
            }
            payload.truncate(body_len);
        }
    }

    payload[0] &= 0x0F;
    let address = socks_addr::parse_address(&mut payload)?;

    let request = RequestHeader {
        version: VERSION,
        command: RequestCommand::Udp,
        address,
        option,
    };
    Ok((request, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aead_account() -> MemoryAccount {
        MemoryAccount::new("test-password", CipherKind::Aes128Gcm, OtaPolicy::Auto)
    }

    fn plain_account(policy: OtaPolicy) -> MemoryAccount {
        MemoryAccount::new("test-password", CipherKind::None, policy)
    }

    #[tokio::test]
    async fn tcp_request_roundtrip_with_aead_cipher() {
        let account = aead_account();
        let (client, server) = tokio::io::duplex(4096);
        let (_client_read, client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Tcp,
            address: TargetAddr::Domain("example.com".into(), 443),
            option: RequestOption::default(),
        };
        let mut body = write_tcp_request(&account, &mut request, client_write)
            .await
            .unwrap();
        body.write_multi_buffer(MultiBuffer::from(&b"GET /"[..])).await.unwrap();

        let (parsed, mut reader) = read_tcp_session(&account, server_read).await.unwrap();
        assert_eq!(parsed.version, VERSION);
        assert_eq!(parsed.command, RequestCommand::Tcp);
        assert_eq!(parsed.address, TargetAddr::Domain("example.com".into(), 443));
        assert!(!parsed.option.has(RequestOption::ONE_TIME_AUTH));

        let mb = reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"GET /");
    }

    #[tokio::test]
    async fn tcp_request_roundtrip_with_ota() {
        let account = plain_account(OtaPolicy::Enabled);
        let (client, server) = tokio::io::duplex(4096);
        let (_client_read, client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Tcp,
            address: TargetAddr::SocketAddr("10.0.0.1:8080".parse().unwrap()),
            option: RequestOption::ONE_TIME_AUTH,
        };
        let mut body = write_tcp_request(&account, &mut request, client_write)
            .await
            .unwrap();
        body.write_multi_buffer(MultiBuffer::from(&b"chunked payload"[..]))
            .await
            .unwrap();

        let (parsed, mut reader) = read_tcp_session(&account, server_read).await.unwrap();
        assert!(parsed.option.has(RequestOption::ONE_TIME_AUTH));
        assert_eq!(
            parsed.address,
            TargetAddr::SocketAddr("10.0.0.1:8080".parse().unwrap())
        );

        let mb = reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"chunked payload");
    }

    #[tokio::test]
    async fn ota_policy_mismatch_is_rejected_both_ways() {
        // OTA flag set while the server disables it.
        let sender = plain_account(OtaPolicy::Auto);
        let (client, server) = tokio::io::duplex(4096);
        let (_cr, cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);
        let mut request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Tcp,
            address: TargetAddr::Domain("a.test".into(), 80),
            option: RequestOption::ONE_TIME_AUTH,
        };
        write_tcp_request(&sender, &mut request, cw).await.unwrap();
        let err = read_tcp_session(&plain_account(OtaPolicy::Disabled), sr)
            .await
            .unwrap_err();
        assert!(matches!(err, ShadowsocksError::OtaForbidden));

        // OTA flag clear while the server requires it.
        let (client, server) = tokio::io::duplex(4096);
        let (_cr, cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);
        let mut request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Tcp,
            address: TargetAddr::Domain("a.test".into(), 80),
            option: RequestOption::default(),
        };
        write_tcp_request(&plain_account(OtaPolicy::Auto), &mut request, cw)
            .await
            .unwrap();
        let err = read_tcp_session(&plain_account(OtaPolicy::Enabled), sr)
            .await
            .unwrap_err();
        assert!(matches!(err, ShadowsocksError::OtaRequired));
    }

    #[test]
    fn udp_roundtrip_with_aead_cipher() {
        let account = MemoryAccount::new("udp-pw", CipherKind::ChaCha20Poly1305, OtaPolicy::Auto);
        let request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Udp,
            address: TargetAddr::SocketAddr("8.8.8.8:53".parse().unwrap()),
            option: RequestOption::default(),
        };

        let packet = encode_udp_packet(&account, &request, b"dns query").unwrap();
        let (parsed, payload) = decode_udp_packet(&account, packet).unwrap();
        assert_eq!(parsed.command, RequestCommand::Udp);
        assert_eq!(parsed.address, request.address);
        assert_eq!(&payload[..], b"dns query");
    }

    #[test]
    fn udp_ota_mac_mutation_is_rejected() {
        let account = plain_account(OtaPolicy::Enabled);
        let request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Udp,
            address: TargetAddr::SocketAddr("1.2.3.4:9000".parse().unwrap()),
            option: RequestOption::ONE_TIME_AUTH,
        };

        let mut packet = encode_udp_packet(&account, &request, b"datagram").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01;

        let err = decode_udp_packet(&account, packet).unwrap_err();
        assert!(matches!(err, ShadowsocksError::InvalidOta));
    }

    #[tokio::test]
    async fn tcp_response_roundtrip() {
        let account = aead_account();
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, _cw) = tokio::io::split(client);
        let (_sr, server_write) = tokio::io::split(server);

        let mut writer = write_tcp_response(&account, server_write).await.unwrap();
        writer.write_multi_buffer(MultiBuffer::from(&b"response data"[..]))
            .await
            .unwrap();

        let mut reader = read_tcp_response(&account, client_read).await.unwrap();
        let mb = reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"response data");
    }
}
