use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::net::{Destination, Network};
use crate::policy::Policy;
use crate::ray::{InboundRay, OutboundRay};

/// A replaceable subsystem with a managed lifecycle.
#[async_trait::async_trait]
pub trait Feature: Send + Sync {
    async fn start(&self) -> crate::Result<()>;
    async fn close(&self) -> crate::Result<()>;
}

#[async_trait::async_trait]
pub trait DnsClient: Feature {
    async fn lookup_ip(&self, domain: &str) -> crate::Result<Vec<IpAddr>>;
}

pub trait PolicyManager: Feature {
    fn for_level(&self, level: u32) -> Policy;
}

#[async_trait::async_trait]
pub trait Router: Feature {
    /// Picks the outbound tag for a connection, or `None` to fall through
    /// to the default outbound.
    async fn pick_route(&self, ctx: &DispatchContext) -> Option<String>;
}

#[async_trait::async_trait]
pub trait Dispatcher: Feature {
    async fn dispatch(
        &self,
        ctx: DispatchContext,
        dest: Destination,
    ) -> crate::Result<InboundRay>;
}

pub trait Clock: Feature {
    fn now(&self) -> SystemTime;
}

pub trait Commander: Feature {}

#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    fn tag(&self) -> &str;
    fn networks(&self) -> Vec<Network>;
    async fn start(&self) -> crate::Result<()>;
    async fn close(&self) -> crate::Result<()>;
}

#[async_trait::async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;
    /// Consumes the outbound half of a ray. Errors end in `close_error`
    /// on the ray rather than a return value.
    async fn dispatch(&self, ctx: DispatchContext, ray: OutboundRay);
    async fn start(&self) -> crate::Result<()>;
    async fn close(&self) -> crate::Result<()>;
}

pub trait InboundHandlerManager: Feature {
    fn add_handler(&self, handler: Arc<dyn InboundHandler>) -> crate::Result<()>;
    fn get_handler(&self, tag: &str) -> crate::Result<Arc<dyn InboundHandler>>;
}

pub trait OutboundHandlerManager: Feature {
    fn add_handler(&self, handler: Arc<dyn OutboundHandler>) -> crate::Result<()>;
    fn get_handler(&self, tag: &str) -> crate::Result<Arc<dyn OutboundHandler>>;
    /// The first handler ever added; used when routing yields no tag.
    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>>;
}

/// A feature paired with the capability slot it backs, if any.
#[derive(Clone)]
pub enum Capability {
    Dns(Arc<dyn DnsClient>),
    Policy(Arc<dyn PolicyManager>),
    Router(Arc<dyn Router>),
    Dispatcher(Arc<dyn Dispatcher>),
    InboundManager(Arc<dyn InboundHandlerManager>),
    OutboundManager(Arc<dyn OutboundHandlerManager>),
    Clock(Arc<dyn Clock>),
    Commander(Arc<dyn Commander>),
    Custom(Arc<dyn Feature>),
}

impl Capability {
    pub fn as_feature(&self) -> Arc<dyn Feature> {
        match self {
            Capability::Dns(f) => f.clone(),
            Capability::Policy(f) => f.clone(),
            Capability::Router(f) => f.clone(),
            Capability::Dispatcher(f) => f.clone(),
            Capability::InboundManager(f) => f.clone(),
            Capability::OutboundManager(f) => f.clone(),
            Capability::Clock(f) => f.clone(),
            Capability::Commander(f) => f.clone(),
            Capability::Custom(f) => f.clone(),
        }
    }
}

/// Current backing of a capability slot.
pub(crate) struct Slot<T: ?Sized> {
    cell: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self { cell: RwLock::new(None) }
    }
}

impl<T: ?Sized> Slot<T> {
    pub fn set(&self, value: Arc<T>) {
        *self.cell.write().unwrap() = Some(value);
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.read().unwrap().clone()
    }
}

// Slot proxies. Accessors on the Instance hand out these stable values;
// they forward to whatever backing is installed at call time, so call
// sites never depend on registration order. Lifecycle calls are no-ops:
// the real features are started from the instance's feature list.
macro_rules! noop_feature {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl Feature for $ty {
            async fn start(&self) -> crate::Result<()> {
                Ok(())
            }

            async fn close(&self) -> crate::Result<()> {
                Ok(())
            }
        }
    };
}

#[derive(Default)]
pub(crate) struct DnsSlot {
    pub backing: Slot<dyn DnsClient>,
}

noop_feature!(DnsSlot);

#[async_trait::async_trait]
impl DnsClient for DnsSlot {
    async fn lookup_ip(&self, domain: &str) -> crate::Result<Vec<IpAddr>> {
        match self.backing.get() {
            Some(f) => f.lookup_ip(domain).await,
            None => Err(PolyrayError::FeatureNotSet("dns")),
        }
    }
}

#[derive(Default)]
pub(crate) struct PolicySlot {
    pub backing: Slot<dyn PolicyManager>,
}

noop_feature!(PolicySlot);

impl PolicyManager for PolicySlot {
    fn for_level(&self, level: u32) -> Policy {
        match self.backing.get() {
            Some(f) => f.for_level(level),
            None => Policy::default(),
        }
    }
}

#[derive(Default)]
pub(crate) struct RouterSlot {
    pub backing: Slot<dyn Router>,
}

noop_feature!(RouterSlot);

#[async_trait::async_trait]
impl Router for RouterSlot {
    async fn pick_route(&self, ctx: &DispatchContext) -> Option<String> {
        match self.backing.get() {
            Some(f) => f.pick_route(ctx).await,
            None => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct DispatcherSlot {
    pub backing: Slot<dyn Dispatcher>,
}

noop_feature!(DispatcherSlot);

#[async_trait::async_trait]
impl Dispatcher for DispatcherSlot {
    async fn dispatch(
        &self,
        ctx: DispatchContext,
        dest: Destination,
    ) -> crate::Result<InboundRay> {
        match self.backing.get() {
            Some(f) => f.dispatch(ctx, dest).await,
            None => Err(PolyrayError::FeatureNotSet("dispatcher")),
        }
    }
}

#[derive(Default)]
pub(crate) struct ClockSlot {
    pub backing: Slot<dyn Clock>,
}

noop_feature!(ClockSlot);

impl Clock for ClockSlot {
    fn now(&self) -> SystemTime {
        match self.backing.get() {
            Some(f) => f.now(),
            None => SystemTime::now(),
        }
    }
}

#[derive(Default)]
pub(crate) struct CommanderSlot {
    pub backing: Slot<dyn Commander>,
}

noop_feature!(CommanderSlot);

impl Commander for CommanderSlot {}

#[derive(Default)]
pub(crate) struct InboundManagerSlot {
    pub backing: Slot<dyn InboundHandlerManager>,
}

noop_feature!(InboundManagerSlot);

impl InboundHandlerManager for InboundManagerSlot {
    fn add_handler(&self, handler: Arc<dyn InboundHandler>) -> crate::Result<()> {
        match self.backing.get() {
            Some(f) => f.add_handler(handler),
            None => Err(PolyrayError::FeatureNotSet("inbound handler manager")),
        }
    }

    fn get_handler(&self, tag: &str) -> crate::Result<Arc<dyn InboundHandler>> {
        match self.backing.get() {
            Some(f) => f.get_handler(tag),
            None => Err(PolyrayError::FeatureNotSet("inbound handler manager")),
        }
    }
}

#[derive(Default)]
pub(crate) struct OutboundManagerSlot {
    pub backing: Slot<dyn OutboundHandlerManager>,
}

noop_feature!(OutboundManagerSlot);

impl OutboundHandlerManager for OutboundManagerSlot {
    fn add_handler(&self, handler: Arc<dyn OutboundHandler>) -> crate::Result<()> {
        match self.backing.get() {
            Some(f) => f.add_handler(handler),
            None => Err(PolyrayError::FeatureNotSet("outbound handler manager")),
        }
    }

    fn get_handler(&self, tag: &str) -> crate::Result<Arc<dyn OutboundHandler>> {
        match self.backing.get() {
            Some(f) => f.get_handler(tag),
            None => Err(PolyrayError::FeatureNotSet("outbound handler manager")),
        }
    }

    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.backing.get().and_then(|f| f.default_handler())
    }
}
