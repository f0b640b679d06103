use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use crate::clock::SystemClock;
use crate::dispatcher::DefaultDispatcher;
use crate::dns::LocalDnsClient;
use crate::error::PolyrayError;
use crate::feature::Capability;
use crate::instance::Instance;
use crate::mux::MultiplexingConfig;
use crate::net::Destination;
use crate::policy::{LevelPolicyManager, PolicyConfig};
use crate::protocol::shadowsocks::{CipherKind, OtaPolicy};
use crate::proxy::socks::SocksConfig;
use crate::proxyman;

pub const TYPE_DISPATCHER: &str = "polyray.app.dispatcher";
pub const TYPE_INBOUND_MANAGER: &str = "polyray.app.proxyman.inbound";
pub const TYPE_OUTBOUND_MANAGER: &str = "polyray.app.proxyman.outbound";
pub const TYPE_POLICY: &str = "polyray.app.policy";
pub const TYPE_LOCAL_DNS: &str = "polyray.app.dns.local";
pub const TYPE_CLOCK: &str = "polyray.app.clock";

/// An app entry: an opaque settings payload keyed by the type URL that
/// selects its factory.
pub struct TypedSettings {
    pub type_url: String,
    pub settings: Box<dyn Any + Send + Sync>,
}

impl TypedSettings {
    pub fn new(type_url: impl Into<String>, settings: impl Any + Send + Sync) -> Self {
        Self {
            type_url: type_url.into(),
            settings: Box::new(settings),
        }
    }

    /// Entry with empty settings, for features configured by type alone.
    pub fn bare(type_url: impl Into<String>) -> Self {
        Self::new(type_url, ())
    }
}

#[derive(Clone, Debug)]
pub enum InboundProxyConfig {
    Socks(SocksConfig),
    Shadowsocks {
        password: String,
        cipher: CipherKind,
        one_time_auth: OtaPolicy,
        user_level: u32,
    },
}

pub struct InboundHandlerConfig {
    pub tag: String,
    pub listen: SocketAddr,
    pub proxy: InboundProxyConfig,
}

#[derive(Clone, Debug)]
pub enum OutboundProxyConfig {
    Freedom,
    Shadowsocks {
        server: Destination,
        password: String,
        cipher: CipherKind,
        one_time_auth: OtaPolicy,
    },
}

pub struct OutboundHandlerConfig {
    pub tag: String,
    pub proxy: OutboundProxyConfig,
    pub mux: Option<MultiplexingConfig>,
    /// Route the dial through another outbound instead of the transport.
    pub proxy_tag: Option<String>,
}

/// Process-global transport knobs, applied before any feature exists.
#[derive(Default)]
pub struct TransportConfig {}

impl TransportConfig {
    pub(crate) fn apply(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct Config {
    pub app: Vec<TypedSettings>,
    pub inbound: Vec<InboundHandlerConfig>,
    pub outbound: Vec<OutboundHandlerConfig>,
    pub transport: TransportConfig,
}

impl Config {
    /// The app set every usable instance needs: dispatcher, both handler
    /// managers, policy, local DNS and the system clock.
    pub fn standard_apps() -> Vec<TypedSettings> {
        vec![
            TypedSettings::bare(TYPE_INBOUND_MANAGER),
            TypedSettings::bare(TYPE_OUTBOUND_MANAGER),
            TypedSettings::bare(TYPE_DISPATCHER),
            TypedSettings::new(TYPE_POLICY, PolicyConfig::default()),
            TypedSettings::bare(TYPE_LOCAL_DNS),
            TypedSettings::bare(TYPE_CLOCK),
        ]
    }
}

pub type Factory = fn(&Arc<Instance>, &(dyn Any + Send + Sync)) -> crate::Result<Capability>;

/// Type-URL keyed factory registry resolving app entries to features.
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(TYPE_DISPATCHER, |instance, _| {
            Ok(Capability::Dispatcher(DefaultDispatcher::new(
                instance.router(),
                instance.outbound_handler_manager(),
            )))
        });
        registry.register(TYPE_INBOUND_MANAGER, |_, _| {
            Ok(Capability::InboundManager(Arc::new(
                proxyman::inbound::Manager::new(),
            )))
        });
        registry.register(TYPE_OUTBOUND_MANAGER, |_, _| {
            Ok(Capability::OutboundManager(Arc::new(
                proxyman::outbound::Manager::new(),
            )))
        });
        registry.register(TYPE_POLICY, |_, settings| {
            let config = settings
                .downcast_ref::<PolicyConfig>()
                .cloned()
                .unwrap_or_default();
            Ok(Capability::Policy(Arc::new(LevelPolicyManager::new(config))))
        });
        registry.register(TYPE_LOCAL_DNS, |_, _| {
            Ok(Capability::Dns(Arc::new(LocalDnsClient)))
        });
        registry.register(TYPE_CLOCK, |_, _| {
            Ok(Capability::Clock(Arc::new(SystemClock)))
        });
        registry
    }

    pub fn register(&mut self, type_url: impl Into<String>, factory: Factory) {
        self.factories.insert(type_url.into(), factory);
    }

    pub fn create(
        &self,
        instance: &Arc<Instance>,
        settings: &TypedSettings,
    ) -> crate::Result<Capability> {
        let factory = self
            .factories
            .get(&settings.type_url)
            .ok_or_else(|| PolyrayError::UnknownConfigType(settings.type_url.clone()))?;
        factory(instance, settings.settings.as_ref())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
