use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::config::{
    Config, InboundHandlerConfig, InboundProxyConfig, OutboundHandlerConfig,
    OutboundProxyConfig, Registry,
};
use crate::error::PolyrayError;
use crate::feature::{
    Capability, ClockSlot, CommanderSlot, DispatcherSlot, DnsSlot, Feature,
    InboundHandler, InboundManagerSlot, OutboundHandler, OutboundManagerSlot,
    PolicySlot, RouterSlot,
};
use crate::feature::{
    Clock, Commander, DnsClient, Dispatcher, InboundHandlerManager,
    OutboundHandlerManager, PolicyManager, Router,
};
use crate::protocol::shadowsocks::MemoryAccount;
use crate::proxy::shadowsocks::{ShadowsocksInbound, ShadowsocksOutbound};
use crate::proxy::socks::SocksInbound;
use crate::proxy::freedom::FreedomOutbound;
use crate::proxy::Inbound;
use crate::proxyman;

#[derive(Default)]
struct State {
    features: Vec<Arc<dyn Feature>>,
    running: bool,
    closed: bool,
}

/// The process-wide feature container. Construction wires every
/// configured feature and handler; `start` brings them up in
/// registration order; `close` is terminal.
pub struct Instance {
    id: Uuid,
    dns: Arc<DnsSlot>,
    policy: Arc<PolicySlot>,
    router: Arc<RouterSlot>,
    dispatcher: Arc<DispatcherSlot>,
    inbound_manager: Arc<InboundManagerSlot>,
    outbound_manager: Arc<OutboundManagerSlot>,
    clock: Arc<ClockSlot>,
    commander: Arc<CommanderSlot>,
    state: Mutex<State>,
}

impl Instance {
    /// Builds an unstarted instance from `config` with the builtin
    /// factory registry.
    pub async fn new(config: Config) -> crate::Result<Arc<Instance>> {
        Self::new_with_registry(config, &Registry::with_builtins()).await
    }

    pub async fn new_with_registry(
        config: Config,
        registry: &Registry,
    ) -> crate::Result<Arc<Instance>> {
        config.transport.apply()?;

        let instance = Arc::new(Instance {
            id: Uuid::new_v4(),
            dns: Arc::new(DnsSlot::default()),
            policy: Arc::new(PolicySlot::default()),
            router: Arc::new(RouterSlot::default()),
            dispatcher: Arc::new(DispatcherSlot::default()),
            inbound_manager: Arc::new(InboundManagerSlot::default()),
            outbound_manager: Arc::new(OutboundManagerSlot::default()),
            clock: Arc::new(ClockSlot::default()),
            commander: Arc::new(CommanderSlot::default()),
            state: Mutex::new(State::default()),
        });

        if let Err(e) = Self::build(&instance, config, registry).await {
            instance.teardown().await;
            return Err(e);
        }
        Ok(instance)
    }

    async fn build(
        instance: &Arc<Instance>,
        config: Config,
        registry: &Registry,
    ) -> crate::Result<()> {
        for app in &config.app {
            let capability = registry.create(instance, app)?;
            instance.register_feature(capability).await?;
        }

        if instance.dispatcher.backing.get().is_none() {
            return Err(PolyrayError::MissingFeature("dispatcher"));
        }
        if instance.inbound_manager.backing.get().is_none() {
            return Err(PolyrayError::MissingFeature("inbound handler manager"));
        }
        if instance.outbound_manager.backing.get().is_none() {
            return Err(PolyrayError::MissingFeature("outbound handler manager"));
        }

        for outbound in config.outbound {
            let handler = build_outbound(instance, outbound)?;
            instance.outbound_handler_manager().add_handler(handler)?;
        }
        for inbound in config.inbound {
            let handler = build_inbound(instance, inbound)?;
            instance.inbound_handler_manager().add_handler(handler)?;
        }
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registers a feature, installing it as its capability slot's
    /// backing. On a running instance the feature starts immediately.
    pub async fn register_feature(&self, capability: Capability) -> crate::Result<()> {
        match &capability {
            Capability::Dns(f) => self.dns.backing.set(f.clone()),
            Capability::Policy(f) => self.policy.backing.set(f.clone()),
            Capability::Router(f) => self.router.backing.set(f.clone()),
            Capability::Dispatcher(f) => self.dispatcher.backing.set(f.clone()),
            Capability::InboundManager(f) => self.inbound_manager.backing.set(f.clone()),
            Capability::OutboundManager(f) => self.outbound_manager.backing.set(f.clone()),
            Capability::Clock(f) => self.clock.backing.set(f.clone()),
            Capability::Commander(f) => self.commander.backing.set(f.clone()),
            Capability::Custom(_) => {}
        }

        let feature = capability.as_feature();
        let start_now = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(PolyrayError::Closed);
            }
            state.features.push(feature.clone());
            state.running
        };
        if start_now {
            feature.start().await?;
        }
        Ok(())
    }

    /// Starts every registered feature in insertion order. The first
    /// failure aborts; the instance state is then undefined and the
    /// caller should `close`.
    pub async fn start(&self) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PolyrayError::Closed);
        }
        if state.running {
            return Ok(());
        }
        state.running = true;

        let features = state.features.clone();
        for feature in features {
            feature.start().await?;
        }
        tracing::info!("Instance `{}` started", self.id);
        Ok(())
    }

    /// Shuts every feature down, ignoring individual errors. Idempotent;
    /// the instance cannot start again afterwards.
    pub async fn close(&self) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.running = false;

        for feature in state.features.clone() {
            let _ = feature.close().await;
        }
        Ok(())
    }

    /// Reverse-order cleanup for a construction that failed part-way.
    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.running = false;
        let features = std::mem::take(&mut state.features);
        for feature in features.iter().rev() {
            let _ = feature.close().await;
        }
    }

    // Slot accessors. Each returns a stable proxy that follows whatever
    // backing is currently installed.

    pub fn dns_client(&self) -> Arc<dyn DnsClient> {
        self.dns.clone()
    }

    pub fn policy_manager(&self) -> Arc<dyn PolicyManager> {
        self.policy.clone()
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn inbound_handler_manager(&self) -> Arc<dyn InboundHandlerManager> {
        self.inbound_manager.clone()
    }

    pub fn outbound_handler_manager(&self) -> Arc<dyn OutboundHandlerManager> {
        self.outbound_manager.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn commander(&self) -> Arc<dyn Commander> {
        self.commander.clone()
    }
}

fn build_inbound(
    instance: &Arc<Instance>,
    config: InboundHandlerConfig,
) -> crate::Result<Arc<dyn InboundHandler>> {
    let proxy: Arc<dyn Inbound> = match config.proxy {
        InboundProxyConfig::Socks(socks) => {
            Arc::new(SocksInbound::new(socks, instance.policy_manager()))
        }
        InboundProxyConfig::Shadowsocks { password, cipher, one_time_auth, user_level } => {
            let account = Arc::new(MemoryAccount::new(&password, cipher, one_time_auth));
            Arc::new(ShadowsocksInbound::new(
                account,
                instance.policy_manager(),
                user_level,
            ))
        }
    };
    Ok(Arc::new(proxyman::inbound::Handler::new(
        config.tag,
        config.listen,
        proxy,
        instance.dispatcher(),
    )))
}

fn build_outbound(
    instance: &Arc<Instance>,
    config: OutboundHandlerConfig,
) -> crate::Result<Arc<dyn OutboundHandler>> {
    let proxy: Arc<dyn crate::proxy::Outbound> = match config.proxy {
        OutboundProxyConfig::Freedom => Arc::new(FreedomOutbound),
        OutboundProxyConfig::Shadowsocks { server, password, cipher, one_time_auth } => {
            let account = Arc::new(MemoryAccount::new(&password, cipher, one_time_auth));
            Arc::new(ShadowsocksOutbound::new(account, server))
        }
    };
    let handler = proxyman::outbound::Handler::new(
        config.tag,
        proxy,
        instance.outbound_handler_manager(),
        config.mux,
        config.proxy_tag,
    )?;
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use crate::config::{TypedSettings, TYPE_DISPATCHER, TYPE_INBOUND_MANAGER, TYPE_OUTBOUND_MANAGER};
    use crate::proxy::socks::SocksConfig;

    struct RecordingFeature {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        fail_start: bool,
    }

    #[async_trait::async_trait]
    impl Feature for RecordingFeature {
        async fn start(&self) -> crate::Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_start {
                return Err(PolyrayError::Connection);
            }
            Ok(())
        }

        async fn close(&self) -> crate::Result<()> {
            self.log.lock().unwrap().push(format!("close:{}", self.name));
            Ok(())
        }
    }

    fn minimal_config() -> Config {
        Config {
            app: vec![
                TypedSettings::bare(TYPE_INBOUND_MANAGER),
                TypedSettings::bare(TYPE_OUTBOUND_MANAGER),
                TypedSettings::bare(TYPE_DISPATCHER),
            ],
            ..Config::default()
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<StdMutex<Vec<String>>>,
        fail_start: bool,
    ) -> Capability {
        Capability::Custom(Arc::new(RecordingFeature {
            name,
            log: log.clone(),
            fail_start,
        }))
    }

    #[tokio::test]
    async fn features_start_in_registration_order() {
        let instance = Instance::new(minimal_config()).await.unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            instance.register_feature(recorder(name, &log, false)).await.unwrap();
        }

        instance.start().await.unwrap();
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["start:a", "start:b", "start:c"]
        );
    }

    #[tokio::test]
    async fn start_short_circuits_on_first_failure() {
        let instance = Instance::new(minimal_config()).await.unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        instance.register_feature(recorder("a", &log, false)).await.unwrap();
        instance.register_feature(recorder("b", &log, true)).await.unwrap();
        instance.register_feature(recorder("c", &log, false)).await.unwrap();

        assert!(instance.start().await.is_err());
        assert_eq!(log.lock().unwrap().as_slice(), &["start:a", "start:b"]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let instance = Instance::new(minimal_config()).await.unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        instance.register_feature(recorder("a", &log, false)).await.unwrap();

        instance.start().await.unwrap();
        instance.close().await.unwrap();
        instance.close().await.unwrap();
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["start:a", "close:a"]
        );

        assert!(matches!(instance.start().await, Err(PolyrayError::Closed)));
        assert!(matches!(
            instance.register_feature(recorder("late", &log, false)).await,
            Err(PolyrayError::Closed)
        ));
    }

    #[tokio::test]
    async fn late_registration_starts_immediately() {
        let instance = Instance::new(minimal_config()).await.unwrap();
        instance.start().await.unwrap();

        let log = Arc::new(StdMutex::new(Vec::new()));
        instance.register_feature(recorder("late", &log, false)).await.unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &["start:late"]);
    }

    #[tokio::test]
    async fn unknown_app_type_fails_construction() {
        let config = Config {
            app: vec![TypedSettings::bare("polyray.app.bogus")],
            ..Config::default()
        };
        assert!(matches!(
            Instance::new(config).await,
            Err(PolyrayError::UnknownConfigType(_))
        ));
    }

    #[tokio::test]
    async fn missing_required_feature_fails_construction() {
        let config = Config {
            app: vec![TypedSettings::bare(TYPE_INBOUND_MANAGER)],
            ..Config::default()
        };
        assert!(matches!(
            Instance::new(config).await,
            Err(PolyrayError::MissingFeature(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_outbound_tag_fails_construction() {
        let mut config = minimal_config();
        for _ in 0..2 {
            config.outbound.push(crate::config::OutboundHandlerConfig {
                tag: "direct".into(),
                proxy: crate::config::OutboundProxyConfig::Freedom,
                mux: None,
                proxy_tag: None,
            });
        }
        assert!(matches!(
            Instance::new(config).await,
            Err(PolyrayError::DuplicateTag(_))
        ));
    }

    /// Full pipeline: SOCKS5 handshake in, dispatch, freedom outbound,
    /// bytes echoed end to end.
    #[tokio::test]
    async fn socks_to_freedom_end_to_end() {
        let mut config = minimal_config();
        config.app.push(TypedSettings::new(
            crate::config::TYPE_POLICY,
            crate::policy::PolicyConfig::default(),
        ));
        config.outbound.push(crate::config::OutboundHandlerConfig {
            tag: "direct".into(),
            proxy: crate::config::OutboundProxyConfig::Freedom,
            mux: None,
            proxy_tag: None,
        });
        let instance = Instance::new(config).await.unwrap();

        let socks = Arc::new(proxyman::inbound::Handler::new(
            "socks",
            "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            Arc::new(SocksInbound::new(
                SocksConfig::default(),
                instance.policy_manager(),
            )),
            instance.dispatcher(),
        ));
        instance
            .inbound_handler_manager()
            .add_handler(socks.clone())
            .unwrap();
        instance.start().await.unwrap();

        // Echo target.
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        // Hand-rolled SOCKS5 client.
        let mut client = tokio::net::TcpStream::connect(socks.local_addr()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let ip = match echo_addr {
            SocketAddr::V4(v4) => v4.ip().octets(),
            _ => unreachable!(),
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply[1], 0x00);

        client.write_all(b"round trip").await.unwrap();
        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"round trip");

        instance.close().await.unwrap();
    }
}
