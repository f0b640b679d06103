use std::sync::Arc;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use crate::buffer::{copy, MultiBuffer, Writer};
use crate::context::DispatchContext;
use crate::dispatcher::{RayUdpDispatcher, UdpDispatcher};
use crate::error::{PolyrayError, ShadowsocksError};
use crate::feature::{Dispatcher, PolicyManager};
use crate::net::{AsyncStream, Destination, Network, TargetAddr};
use crate::protocol::shadowsocks::{
    self, MemoryAccount, RequestCommand, RequestHeader, RequestOption,
};
use crate::proxy::{Dialer, Inbound, Outbound};
use crate::ray::{InboundRay, OutboundRay};
use crate::signal::cancel_after_inactivity;

/// Shadowsocks TCP server: decodes the request header, dispatches the
/// destination and relays the re-encoded payload.
pub struct ShadowsocksInbound {
    account: Arc<MemoryAccount>,
    policy_manager: Arc<dyn PolicyManager>,
    user_level: u32,
}

impl ShadowsocksInbound {
    pub fn new(
        account: Arc<MemoryAccount>,
        policy_manager: Arc<dyn PolicyManager>,
        user_level: u32,
    ) -> Self {
        Self { account, policy_manager, user_level }
    }
}

#[async_trait::async_trait]
impl Inbound for ShadowsocksInbound {
    fn networks(&self) -> Vec<Network> {
        vec![Network::Tcp, Network::Udp]
    }

    async fn process(
        &self,
        ctx: DispatchContext,
        stream: Box<dyn AsyncStream>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> crate::Result<()> {
        let policy = self.policy_manager.for_level(self.user_level);
        let (read_half, write_half) = tokio::io::split(stream);

        let handshake = tokio::time::timeout(
            policy.timeouts.handshake,
            shadowsocks::read_tcp_session(&self.account, read_half),
        );
        let (request, mut body_reader) = match handshake.await {
            Ok(result) => result?,
            Err(_) => return Err(PolyrayError::Timeout),
        };

        if request.command != RequestCommand::Tcp {
            return Err(ShadowsocksError::MissingAddress.into());
        }
        let dest = request.destination();
        tracing::info!("Received request for `{}`", dest);

        let cancel = ctx.cancel.clone();
        let timer = cancel_after_inactivity(cancel.clone(), policy.timeouts.connection_idle);

        let ray = dispatcher.dispatch(ctx.child_with_target(dest.clone()), dest).await?;
        let InboundRay { mut input, mut output } = ray;
        let input_ctl = input.controller();
        let output_ctl = output.controller();

        let account = self.account.clone();
        let request_done = async {
            let result = copy(&mut body_reader, &mut input, Some(&timer)).await;
            input.close();
            result?;
            timer.set_timeout(policy.timeouts.downlink_only);
            Ok::<(), std::io::Error>(())
        };

        let response_done = async {
            let mut writer = shadowsocks::write_tcp_response(&account, write_half)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            copy(&mut output, &mut writer, Some(&timer)).await?;
            // Zero-length sealed frame: end-of-stream for the peer's reader.
            let _ = writer.write_multi_buffer(MultiBuffer::new()).await;
            timer.set_timeout(policy.timeouts.uplink_only);
            Ok::<(), std::io::Error>(())
        };

        let result = tokio::select! {
            r = async { tokio::try_join!(request_done, response_done) } => r.map(|_| ()),
            _ = cancel.cancelled() => Err(std::io::ErrorKind::TimedOut.into()),
        };

        if let Err(e) = result {
            input_ctl.close_error();
            output_ctl.close_error();
            return Err(e.into());
        }
        Ok(())
    }

    /// Per-packet path: decode, feed the NAT dispatcher, and write
    /// re-encoded replies back on the same socket.
    async fn process_packets(
        &self,
        ctx: DispatchContext,
        socket: Arc<UdpSocket>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> crate::Result<()> {
        let udp = RayUdpDispatcher::new(dispatcher);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let packet = BytesMut::from(&buf[..n]);
            let (request, data) = match shadowsocks::decode_udp_packet(&self.account, packet) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!("failed to parse UDP request from `{}`: {}", peer, e);
                    continue;
                }
            };
            if data.is_empty() {
                continue;
            }

            let dest = request.destination();
            tracing::debug!("send packet to `{}` with {} bytes", dest, data.len());

            let mut packet_ctx = ctx.clone();
            packet_ctx.source = Some(Destination::udp(TargetAddr::SocketAddr(peer)));

            let account = self.account.clone();
            let socket = socket.clone();
            let reply = Box::new(move |payload: BytesMut| {
                let message = match shadowsocks::encode_udp_packet(&account, &request, &payload)
                {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("failed to write UDP response: {}", e);
                        return;
                    }
                };
                let socket = socket.clone();
                tokio::spawn(async move {
                    let _ = socket.send_to(&message, peer).await;
                });
            });
            udp.dispatch(packet_ctx, dest, data, reply).await;
        }
    }
}

/// Shadowsocks client: re-encodes a dispatched ray toward an upstream
/// shadowsocks server.
pub struct ShadowsocksOutbound {
    account: Arc<MemoryAccount>,
    server: Destination,
}

impl ShadowsocksOutbound {
    pub fn new(account: Arc<MemoryAccount>, server: Destination) -> Self {
        Self { account, server }
    }
}

#[async_trait::async_trait]
impl Outbound for ShadowsocksOutbound {
    async fn process(
        &self,
        ctx: DispatchContext,
        ray: OutboundRay,
        dialer: Arc<dyn Dialer>,
    ) -> crate::Result<()> {
        let dest = ctx.target.clone().ok_or(PolyrayError::NoTarget)?;
        tracing::info!("Tunneling request to `{}` via `{}`", dest, self.server);

        let stream = dialer.dial(&ctx, self.server.clone()).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let OutboundRay { mut input, mut output } = ray;

        let mut request = RequestHeader {
            version: shadowsocks::VERSION,
            command: match dest.network {
                Network::Tcp => RequestCommand::Tcp,
                Network::Udp => RequestCommand::Udp,
            },
            address: dest.addr,
            option: RequestOption::default(),
        };
        if self.account.wants_one_time_auth() {
            request.option.set(RequestOption::ONE_TIME_AUTH);
        }

        let mut body_writer =
            shadowsocks::write_tcp_request(&self.account, &mut request, write_half).await?;

        let account = self.account.clone();
        let request_done = async {
            copy(&mut input, &mut body_writer, None).await?;
            // Zero-length sealed frame: end-of-stream for the peer's reader.
            let _ = body_writer.write_multi_buffer(MultiBuffer::new()).await;
            Ok::<(), std::io::Error>(())
        };

        let response_done = async {
            let mut reader = shadowsocks::read_tcp_response(&account, read_half)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            copy(&mut reader, &mut output, None).await?;
            output.close();
            Ok::<(), std::io::Error>(())
        };

        tokio::try_join!(request_done, response_done)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::buffer::MultiBuffer;
    use crate::feature::Feature;
    use crate::net::TargetAddr;
    use crate::policy::{LevelPolicyManager, PolicyConfig};
    use crate::protocol::shadowsocks::{CipherKind, OtaPolicy};
    use crate::ray::new_ray;

    /// Dials into the paired duplex end held by the test.
    struct DuplexDialer {
        stream: Mutex<Option<Box<dyn AsyncStream>>>,
    }

    #[async_trait::async_trait]
    impl Dialer for DuplexDialer {
        async fn dial(
            &self,
            _ctx: &DispatchContext,
            _dest: Destination,
        ) -> crate::Result<Box<dyn AsyncStream>> {
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or(PolyrayError::Connection)
        }
    }

    /// Echoes everything written into the dispatched ray.
    struct EchoDispatcher {
        seen: Mutex<Vec<Destination>>,
    }

    #[async_trait::async_trait]
    impl Feature for EchoDispatcher {
        async fn start(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn close(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            _ctx: DispatchContext,
            dest: Destination,
        ) -> crate::Result<InboundRay> {
            self.seen.lock().unwrap().push(dest);
            let (inbound, outbound) = new_ray();
            tokio::spawn(async move {
                let OutboundRay { mut input, output } = outbound;
                while let Ok(Some(mb)) = input.read().await {
                    if output.write(mb).await.is_err() {
                        break;
                    }
                }
                output.close();
            });
            Ok(inbound)
        }
    }

    #[tokio::test]
    async fn client_to_server_relay_over_aead() {
        let account = Arc::new(MemoryAccount::new(
            "relay-pw",
            CipherKind::Aes256Gcm,
            OtaPolicy::Auto,
        ));

        let (client_side, server_side) = tokio::io::duplex(16 * 1024);

        // Server half processes the connection against an echo dispatcher.
        let dispatcher = Arc::new(EchoDispatcher { seen: Mutex::new(Vec::new()) });
        let inbound = ShadowsocksInbound::new(
            account.clone(),
            Arc::new(LevelPolicyManager::new(PolicyConfig::default())),
            0,
        );
        let server_dispatcher = dispatcher.clone();
        let server = tokio::spawn(async move {
            inbound
                .process(
                    DispatchContext::default(),
                    Box::new(server_side),
                    server_dispatcher,
                )
                .await
        });

        // Client half drives a ray through the outbound.
        let outbound_proxy = ShadowsocksOutbound::new(
            account.clone(),
            Destination::tcp(TargetAddr::Domain("ss.test".into(), 8388)),
        );
        let dialer = Arc::new(DuplexDialer {
            stream: Mutex::new(Some(Box::new(client_side))),
        });
        let (inbound_ray, outbound_ray) = new_ray();
        let target = Destination::tcp(TargetAddr::Domain("origin.test".into(), 80));
        let ctx = DispatchContext::with_target(target.clone());
        let client = tokio::spawn(async move {
            outbound_proxy.process(ctx, outbound_ray, dialer).await
        });

        inbound_ray
            .input
            .write(MultiBuffer::from(&b"ping through the tunnel"[..]))
            .await
            .unwrap();

        let mut inbound_ray = inbound_ray;
        let mb = inbound_ray.output.read().await.unwrap().unwrap();
        assert_eq!(&mb.to_bytes()[..], b"ping through the tunnel");
        assert_eq!(
            dispatcher.seen.lock().unwrap().as_slice(),
            &[target]
        );

        inbound_ray.input.close();
        let _ = client.await.unwrap();
        drop(inbound_ray);
        let _ = server.await;
    }

    /// Datagram path through the whole plane: handler UDP worker, NAT
    /// dispatcher, default dispatcher, freedom outbound, and back.
    #[tokio::test]
    async fn udp_relay_end_to_end() {
        use std::time::Duration;
        use crate::dispatcher::DefaultDispatcher;
        use crate::feature::{
            InboundHandler, OutboundHandlerManager, RouterSlot,
        };
        use crate::protocol::shadowsocks::{decode_udp_packet, encode_udp_packet, VERSION};
        use crate::proxy::freedom::FreedomOutbound;
        use crate::proxyman;

        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, peer) = origin.recv_from(&mut buf).await.unwrap();
            origin.send_to(&buf[..n], peer).await.unwrap();
        });

        let account = Arc::new(MemoryAccount::new(
            "udp-relay-pw",
            CipherKind::Aes128Gcm,
            OtaPolicy::Auto,
        ));

        let manager = Arc::new(proxyman::outbound::Manager::new());
        let om: Arc<dyn OutboundHandlerManager> = manager.clone();
        let direct =
            proxyman::outbound::Handler::new("direct", Arc::new(FreedomOutbound), om, None, None)
                .unwrap();
        manager.add_handler(direct).unwrap();
        let dispatcher = DefaultDispatcher::new(Arc::new(RouterSlot::default()), manager);

        let handler = Arc::new(proxyman::inbound::Handler::new(
            "ss-udp",
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ShadowsocksInbound::new(
                account.clone(),
                Arc::new(LevelPolicyManager::new(PolicyConfig::default())),
                0,
            )),
            dispatcher,
        ));
        handler.start().await.unwrap();
        let server_addr = handler.local_addr();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = RequestHeader {
            version: VERSION,
            command: RequestCommand::Udp,
            address: TargetAddr::SocketAddr(origin_addr),
            option: RequestOption::default(),
        };
        let packet = encode_udp_packet(&account, &request, b"udp ping").unwrap();
        client.send_to(&packet, server_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (reply, payload) =
            decode_udp_packet(&account, BytesMut::from(&buf[..n])).unwrap();
        assert_eq!(&payload[..], b"udp ping");
        assert_eq!(reply.address, TargetAddr::SocketAddr(origin_addr));

        handler.close().await.unwrap();
    }
}
