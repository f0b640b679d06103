use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::feature::{Feature, OutboundHandler, OutboundHandlerManager};
use crate::mux::{ClientManager, MultiplexingConfig};
use crate::net::{AsyncStream, Destination};
use crate::proxy::{Dialer, Outbound, TcpDialer};
use crate::ray::{new_ray, OutboundRay, RayStream};

/// Tagged registry of outbound handlers. The first handler added is the
/// default route target.
#[derive(Default)]
pub struct Manager {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    handlers: Vec<Arc<dyn OutboundHandler>>,
    tagged: HashMap<String, Arc<dyn OutboundHandler>>,
    default: Option<Arc<dyn OutboundHandler>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Feature for Manager {
    async fn start(&self) -> crate::Result<()> {
        let handlers = self.state.lock().unwrap().handlers.clone();
        for handler in handlers {
            handler.start().await?;
        }
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        let handlers = self.state.lock().unwrap().handlers.clone();
        for handler in handlers {
            let _ = handler.close().await;
        }
        Ok(())
    }
}

impl OutboundHandlerManager for Manager {
    fn add_handler(&self, handler: Arc<dyn OutboundHandler>) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        let tag = handler.tag().to_string();
        if !tag.is_empty() {
            if state.tagged.contains_key(&tag) {
                return Err(PolyrayError::DuplicateTag(tag));
            }
            state.tagged.insert(tag, handler.clone());
        }
        if state.default.is_none() {
            state.default = Some(handler.clone());
        }
        state.handlers.push(handler);
        Ok(())
    }

    fn get_handler(&self, tag: &str) -> crate::Result<Arc<dyn OutboundHandler>> {
        self.state
            .lock()
            .unwrap()
            .tagged
            .get(tag)
            .cloned()
            .ok_or_else(|| PolyrayError::HandlerNotFound(tag.to_string()))
    }

    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.state.lock().unwrap().default.clone()
    }
}

/// One configured outbound: a proxy, an optional mux client pool, and the
/// dialer chain used to reach upstream.
pub struct Handler {
    tag: String,
    proxy: Arc<dyn Outbound>,
    mux: OnceLock<ClientManager>,
    outbound_manager: Arc<dyn OutboundHandlerManager>,
    proxy_tag: Option<String>,
    weak_self: OnceLock<Weak<Handler>>,
}

impl Handler {
    pub fn new(
        tag: impl Into<String>,
        proxy: Arc<dyn Outbound>,
        outbound_manager: Arc<dyn OutboundHandlerManager>,
        mux_config: Option<MultiplexingConfig>,
        proxy_tag: Option<String>,
    ) -> crate::Result<Arc<Self>> {
        let handler = Arc::new(Self {
            tag: tag.into(),
            proxy: proxy.clone(),
            mux: OnceLock::new(),
            outbound_manager,
            proxy_tag,
            weak_self: OnceLock::new(),
        });
        let _ = handler.weak_self.set(Arc::downgrade(&handler));

        if let Some(config) = mux_config {
            if config.enabled {
                if config.concurrency < 1 || config.concurrency > 1024 {
                    return Err(PolyrayError::InvalidConcurrency(config.concurrency));
                }
                let dialer: Arc<dyn Dialer> = handler.clone();
                let _ = handler.mux.set(ClientManager::new(proxy, dialer, &config));
            }
        }
        Ok(handler)
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        match self.weak_self.get().and_then(|w| w.upgrade()) {
            Some(me) => me,
            None => Arc::new(TcpDialer),
        }
    }
}

#[async_trait::async_trait]
impl OutboundHandler for Handler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, ctx: DispatchContext, ray: OutboundRay) {
        if let Some(mux) = self.mux.get() {
            let output_ctl = ray.output.controller();
            if let Err(e) = mux.dispatch(ctx, ray).await {
                tracing::warn!("failed to process outbound traffic: {}", e);
                output_ctl.close_error();
            }
            return;
        }

        let input_ctl = ray.input.controller();
        let output_ctl = ray.output.controller();
        match self.proxy.process(ctx, ray, self.dialer()).await {
            Err(e) if !e.is_eof() => {
                tracing::warn!("failed to process outbound traffic: {}", e);
                output_ctl.close_error();
            }
            _ => output_ctl.close(),
        }
        input_ctl.close_error();
    }

    async fn start(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dialer for Handler {
    async fn dial(
        &self,
        ctx: &DispatchContext,
        dest: Destination,
    ) -> crate::Result<Box<dyn AsyncStream>> {
        if let Some(tag) = &self.proxy_tag {
            match self.outbound_manager.get_handler(tag) {
                Ok(handler) => {
                    tracing::debug!("proxying to `{}` for dest `{}`", tag, dest);
                    let ctx = ctx.child_with_target(dest);
                    let (inbound, outbound) = new_ray();
                    tokio::spawn(async move {
                        handler.dispatch(ctx, outbound).await;
                    });
                    return Ok(Box::new(RayStream::from(inbound)));
                }
                Err(_) => {
                    tracing::warn!("failed to get outbound handler with tag `{}`", tag);
                }
            }
        }
        TcpDialer.dial(ctx, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOutbound;

    #[async_trait::async_trait]
    impl Outbound for NullOutbound {
        async fn process(
            &self,
            _ctx: DispatchContext,
            ray: OutboundRay,
            _dialer: Arc<dyn Dialer>,
        ) -> crate::Result<()> {
            drop(ray);
            Ok(())
        }
    }

    fn null_handler(tag: &str, manager: &Arc<Manager>) -> Arc<Handler> {
        let om: Arc<dyn OutboundHandlerManager> = manager.clone();
        Handler::new(tag, Arc::new(NullOutbound), om, None, None).unwrap()
    }

    #[test]
    fn first_handler_becomes_default() {
        let manager = Arc::new(Manager::new());
        let a = null_handler("a", &manager);
        let b = null_handler("b", &manager);
        manager.add_handler(a.clone()).unwrap();
        manager.add_handler(b).unwrap();

        let default = manager.default_handler().unwrap();
        assert_eq!(default.tag(), "a");
        assert_eq!(manager.get_handler("b").unwrap().tag(), "b");
    }

    #[test]
    fn mux_concurrency_is_validated() {
        let manager = Arc::new(Manager::new());
        let om: Arc<dyn OutboundHandlerManager> = manager.clone();
        let result = Handler::new(
            "m",
            Arc::new(NullOutbound),
            om,
            Some(MultiplexingConfig { enabled: true, concurrency: 4096 }),
            None,
        );
        assert!(matches!(result, Err(PolyrayError::InvalidConcurrency(4096))));
    }
}
