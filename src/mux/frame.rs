use std::io;
use bytes::{Buf, BufMut, BytesMut};
use crate::buffer::{BufferedReader, MultiBuffer, Reader, TransferType};
use crate::error::MuxError;
use crate::net::{Destination, Network, TargetAddr};
use crate::protocol::socks_addr;
use crate::ray::PipeWriter;

pub const MUX_COOL_DOMAIN: &str = "v1.mux.cool";
pub const MUX_COOL_PORT: u16 = 9527;

/// Per-frame data bodies are capped so a slow session cannot hog the
/// shared connection.
const FRAME_DATA_LIMIT: usize = 8 * 1024;

const NETWORK_TCP: u8 = 1;
const NETWORK_UDP: u8 = 2;

/// The pseudo-destination that flags a stream as mux-bearing to the peer.
pub fn mux_destination() -> Destination {
    Destination::tcp(TargetAddr::Domain(MUX_COOL_DOMAIN.into(), MUX_COOL_PORT))
}

pub fn is_mux_destination(dest: &Destination) -> bool {
    matches!(
        &dest.addr,
        TargetAddr::Domain(d, p) if d == MUX_COOL_DOMAIN && *p == MUX_COOL_PORT
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    New = 0x01,
    Keep = 0x02,
    End = 0x03,
    KeepAlive = 0x04,
}

impl TryFrom<u8> for SessionStatus {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::New),
            0x02 => Ok(Self::Keep),
            0x03 => Ok(Self::End),
            0x04 => Ok(Self::KeepAlive),
            v => Err(MuxError::UnknownStatus(v)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOption(u8);

impl FrameOption {
    pub const DATA: FrameOption = FrameOption(0x01);

    pub fn has(&self, other: FrameOption) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: FrameOption) {
        self.0 |= other.0;
    }
}

/// Metadata preceding every mux frame:
/// `2B meta_len | id | status | option | [network + target]`.
#[derive(Clone, Debug)]
pub struct FrameMetadata {
    pub session_id: u16,
    pub status: SessionStatus,
    pub option: FrameOption,
    pub target: Option<Destination>,
}

impl FrameMetadata {
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), MuxError> {
        let mut meta = BytesMut::new();
        meta.put_u16(self.session_id);
        meta.put_u8(self.status as u8);
        meta.put_u8(self.option.0);

        if self.status == SessionStatus::New {
            if let Some(target) = &self.target {
                meta.put_u8(match target.network {
                    Network::Tcp => NETWORK_TCP,
                    Network::Udp => NETWORK_UDP,
                });
                socks_addr::append_address(&mut meta, &target.addr)?;
            }
        }

        out.put_u16(meta.len() as u16);
        out.extend_from_slice(&meta);
        Ok(())
    }

    pub async fn read<R: Reader>(reader: &mut BufferedReader<R>) -> Result<Self, MuxError> {
        let len = reader.read_u16().await? as usize;
        let mut meta = reader.read_exact(len).await?;
        if meta.remaining() < 4 {
            return Err(MuxError::TruncatedMetadata);
        }

        let session_id = meta.get_u16();
        let status = SessionStatus::try_from(meta.get_u8())?;
        let option = FrameOption(meta.get_u8());

        let target = if status == SessionStatus::New {
            if meta.remaining() < 1 {
                return Err(MuxError::TruncatedMetadata);
            }
            let network = match meta.get_u8() {
                NETWORK_TCP => Network::Tcp,
                NETWORK_UDP => Network::Udp,
                n => return Err(MuxError::UnknownNetwork(n)),
            };
            let addr = socks_addr::parse_address(&mut meta)?;
            Some(Destination { network, addr })
        } else {
            None
        };

        Ok(Self { session_id, status, option, target })
    }
}

fn mux_io_err(e: MuxError) -> io::Error {
    match e {
        MuxError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Emits one session's frames onto the shared connection: `New` (with the
/// target) first for client sessions, then `Keep` bodies, `End` on close.
pub struct FrameWriter {
    session_id: u16,
    target: Option<Destination>,
    output: PipeWriter,
    transfer: TransferType,
    meta_sent: bool,
}

impl FrameWriter {
    pub fn new_client(
        session_id: u16,
        target: Destination,
        output: PipeWriter,
        transfer: TransferType,
    ) -> Self {
        Self {
            session_id,
            target: Some(target),
            output,
            transfer,
            meta_sent: false,
        }
    }

    pub fn new_response(session_id: u16, output: PipeWriter, transfer: TransferType) -> Self {
        Self {
            session_id,
            target: None,
            output,
            transfer,
            meta_sent: false,
        }
    }

    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let status = if self.meta_sent {
            SessionStatus::Keep
        } else if self.target.is_some() {
            SessionStatus::New
        } else {
            SessionStatus::Keep
        };

        let mut option = FrameOption::default();
        option.set(FrameOption::DATA);

        let meta = FrameMetadata {
            session_id: self.session_id,
            status,
            option,
            target: self.target.clone(),
        };

        let mut frame = BytesMut::new();
        meta.encode(&mut frame).map_err(mux_io_err)?;
        frame.put_u16(data.len() as u16);
        frame.extend_from_slice(data);

        self.meta_sent = true;
        self.output.write(MultiBuffer::from(frame)).await
    }

    pub async fn write(&mut self, mut mb: MultiBuffer) -> io::Result<()> {
        match self.transfer {
            TransferType::Stream => loop {
                let chunk = mb.read_bytes(FRAME_DATA_LIMIT);
                self.write_chunk(&chunk).await?;
                if mb.is_empty() {
                    break Ok(());
                }
            },
            TransferType::Packet => loop {
                let chunk = mb.split_first().unwrap_or_default();
                self.write_chunk(&chunk).await?;
                if mb.is_empty() {
                    break Ok(());
                }
            },
        }
    }

    /// Ends the session on the wire. A session that never carried data
    /// still announces itself so the peer observes open and close.
    pub async fn close(&mut self) -> io::Result<()> {
        if !self.meta_sent && self.target.is_some() {
            let meta = FrameMetadata {
                session_id: self.session_id,
                status: SessionStatus::New,
                option: FrameOption::default(),
                target: self.target.clone(),
            };
            let mut frame = BytesMut::new();
            meta.encode(&mut frame).map_err(mux_io_err)?;
            self.output.write(MultiBuffer::from(frame)).await?;
            self.meta_sent = true;
        }

        let meta = FrameMetadata {
            session_id: self.session_id,
            status: SessionStatus::End,
            option: FrameOption::default(),
            target: None,
        };
        let mut frame = BytesMut::new();
        meta.encode(&mut frame).map_err(mux_io_err)?;
        self.output.write(MultiBuffer::from(frame)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(meta: FrameMetadata) -> FrameMetadata {
        let mut buf = BytesMut::new();
        meta.encode(&mut buf).unwrap();

        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async move {
                let (writer, reader) = crate::ray::new_pipe();
                writer.write(MultiBuffer::from(buf)).await.unwrap();
                writer.close();
                let mut br = BufferedReader::new(reader);
                FrameMetadata::read(&mut br).await.unwrap()
            })
    }

    #[test]
    fn new_frame_roundtrips_with_target() {
        let meta = FrameMetadata {
            session_id: 7,
            status: SessionStatus::New,
            option: FrameOption::DATA,
            target: Some(Destination::tcp(TargetAddr::SocketAddr(
                "1.2.3.4:80".parse().unwrap(),
            ))),
        };
        let parsed = roundtrip(meta);
        assert_eq!(parsed.session_id, 7);
        assert_eq!(parsed.status, SessionStatus::New);
        assert!(parsed.option.has(FrameOption::DATA));
        assert_eq!(
            parsed.target,
            Some(Destination::tcp(TargetAddr::SocketAddr(
                "1.2.3.4:80".parse().unwrap()
            )))
        );
    }

    #[test]
    fn keep_frame_carries_no_target() {
        let meta = FrameMetadata {
            session_id: 2,
            status: SessionStatus::Keep,
            option: FrameOption::DATA,
            target: Some(Destination::tcp(TargetAddr::Domain("x.test".into(), 1))),
        };
        let parsed = roundtrip(meta);
        assert_eq!(parsed.status, SessionStatus::Keep);
        assert!(parsed.target.is_none());
    }

    #[tokio::test]
    async fn unknown_status_is_rejected() {
        let (writer, reader) = crate::ray::new_pipe();
        let mut frame = BytesMut::new();
        frame.put_u16(4);
        frame.put_u16(1);
        frame.put_u8(0x09);
        frame.put_u8(0);
        writer.write(MultiBuffer::from(frame)).await.unwrap();

        let mut br = BufferedReader::new(reader);
        assert!(matches!(
            FrameMetadata::read(&mut br).await,
            Err(MuxError::UnknownStatus(0x09))
        ));
    }

    #[test]
    fn sentinel_destination_is_recognized() {
        assert!(is_mux_destination(&mux_destination()));
        assert!(!is_mux_destination(&Destination::tcp(TargetAddr::Domain(
            "example.com".into(),
            9527
        ))));
    }
}
