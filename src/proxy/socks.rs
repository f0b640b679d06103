use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use fast_socks5::server::Socks5ServerProtocol;
use fast_socks5::{ReplyError, Socks5Command, SocksError};
use crate::buffer::{copy, IoReader, IoWriter};
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::feature::{Dispatcher, PolicyManager};
use crate::net::{AsyncStream, Destination, Network, TargetAddr};
use crate::policy::Policy;
use crate::proxy::Inbound;
use crate::ray::InboundRay;
use crate::signal::cancel_after_inactivity;

#[derive(Clone, Debug, Default)]
pub struct SocksConfig {
    pub user_level: u32,
    /// Legacy idle override in seconds, honored for level-0 users only.
    pub timeout: u32,
}

/// SOCKS5 server for TCP CONNECT. Handshakes under the policy handshake
/// timeout, then relays through a dispatched ray under the shared
/// inactivity timer. UDP ASSOCIATE is not offered.
pub struct SocksInbound {
    config: SocksConfig,
    policy_manager: Arc<dyn PolicyManager>,
}

impl SocksInbound {
    pub fn new(config: SocksConfig, policy_manager: Arc<dyn PolicyManager>) -> Self {
        Self { config, policy_manager }
    }

    fn policy(&self) -> Policy {
        let mut policy = self.policy_manager.for_level(self.config.user_level);
        if self.config.timeout > 0 && self.config.user_level == 0 {
            policy.timeouts.connection_idle = Duration::from_secs(self.config.timeout as u64);
        }
        policy
    }
}

#[async_trait::async_trait]
impl Inbound for SocksInbound {
    fn networks(&self) -> Vec<Network> {
        vec![Network::Tcp]
    }

    async fn process(
        &self,
        ctx: DispatchContext,
        stream: Box<dyn AsyncStream>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> crate::Result<()> {
        let policy = self.policy();

        let handshake = tokio::time::timeout(policy.timeouts.handshake, async {
            Socks5ServerProtocol::accept_no_auth(stream)
                .await
                .map_err(Into::<SocksError>::into)?
                .read_command()
                .await
                .map_err(Into::<SocksError>::into)
        });
        let (protocol, cmd, target_addr) = match handshake.await {
            Ok(result) => result?,
            Err(_) => return Err(PolyrayError::Timeout),
        };

        match cmd {
            Socks5Command::TCPConnect => {
                let dest = Destination::tcp(TargetAddr::from(target_addr));
                tracing::info!("TCP Connect request to `{}`", dest);

                let stream = protocol
                    .reply_success(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0))
                    .await
                    .map_err(Into::<SocksError>::into)?;

                transport(ctx, stream, dest, dispatcher, policy).await
            }
            _ => {
                protocol
                    .reply_error(&ReplyError::CommandNotSupported)
                    .await
                    .map_err(Into::<SocksError>::into)?;
                Err(PolyrayError::Socks(ReplyError::CommandNotSupported.into()))
            }
        }
    }
}

/// The per-connection relay: request and response copies share one
/// inactivity timer, half-close tightens the remaining timeout, and the
/// first failure aborts both ray directions.
async fn transport(
    ctx: DispatchContext,
    stream: impl AsyncStream,
    dest: Destination,
    dispatcher: Arc<dyn Dispatcher>,
    policy: Policy,
) -> crate::Result<()> {
    let cancel = ctx.cancel.clone();
    let timer = cancel_after_inactivity(cancel.clone(), policy.timeouts.connection_idle);

    let ray = dispatcher.dispatch(ctx.clone(), dest).await?;
    let InboundRay { mut input, mut output } = ray;
    let input_ctl = input.controller();
    let output_ctl = output.controller();

    let (read_half, write_half) = tokio::io::split(stream);

    let request_done = async {
        let result = copy(&mut IoReader::new(read_half), &mut input, Some(&timer)).await;
        input.close();
        result?;
        timer.set_timeout(policy.timeouts.downlink_only);
        Ok::<(), std::io::Error>(())
    };

    let response_done = async {
        let mut write_half = write_half;
        copy(&mut output, &mut IoWriter::new(&mut write_half), Some(&timer)).await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{LevelPolicyManager, PolicyConfig};

    fn manager() -> Arc<dyn PolicyManager> {
        Arc::new(LevelPolicyManager::new(PolicyConfig::default()))
    }

    #[test]
    fn legacy_timeout_overrides_idle_for_level_zero() {
        let inbound = SocksInbound::new(
            SocksConfig { user_level: 0, timeout: 42 },
            manager(),
        );
        assert_eq!(
            inbound.policy().timeouts.connection_idle,
            Duration::from_secs(42)
        );

        let inbound = SocksInbound::new(
            SocksConfig { user_level: 1, timeout: 42 },
            manager(),
        );
        assert_eq!(
            inbound.policy().timeouts.connection_idle,
            Policy::default().timeouts.connection_idle
        );
    }
}
