use std::sync::{Arc, OnceLock, Weak};
use tracing::Instrument;
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::feature::{Dispatcher, Feature, OutboundHandlerManager, Router};
use crate::mux;
use crate::net::Destination;
use crate::ray::{new_ray, InboundRay};

/// Routes each dispatched connection to an outbound handler: router tag
/// first, then the default outbound. Sentinel-addressed dispatches are
/// served by a mux demultiplexing worker instead of being routed.
pub struct DefaultDispatcher {
    router: Arc<dyn Router>,
    outbound_manager: Arc<dyn OutboundHandlerManager>,
    weak_self: OnceLock<Weak<DefaultDispatcher>>,
}

impl DefaultDispatcher {
    pub fn new(
        router: Arc<dyn Router>,
        outbound_manager: Arc<dyn OutboundHandlerManager>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            router,
            outbound_manager,
            weak_self: OnceLock::new(),
        });
        let _ = dispatcher.weak_self.set(Arc::downgrade(&dispatcher));
        dispatcher
    }

    fn strong_self(&self) -> crate::Result<Arc<dyn Dispatcher>> {
        self.weak_self
            .get()
            .and_then(|w| w.upgrade())
            .map(|me| me as Arc<dyn Dispatcher>)
            .ok_or(PolyrayError::FeatureNotSet("dispatcher"))
    }
}

#[async_trait::async_trait]
impl Feature for DefaultDispatcher {
    async fn start(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dispatcher for DefaultDispatcher {
    async fn dispatch(
        &self,
        ctx: DispatchContext,
        dest: Destination,
    ) -> crate::Result<InboundRay> {
        if mux::is_mux_destination(&dest) {
            return mux::Server::new(self.strong_self()?).dispatch(ctx, dest).await;
        }

        let span = tracing::info_span!("dispatcher", dest = %dest);
        async move {
            let ctx = ctx.child_with_target(dest.clone());

            let handler = match self.router.pick_route(&ctx).await {
                Some(tag) => match self.outbound_manager.get_handler(&tag) {
                    Ok(handler) => Some(handler),
                    Err(_) => {
                        tracing::warn!("routed to unknown outbound `{}`", tag);
                        None
                    }
                },
                None => None,
            };
            let handler = match handler.or_else(|| self.outbound_manager.default_handler()) {
                Some(handler) => handler,
                None => return Err(PolyrayError::NoOutbound),
            };

            tracing::debug!("dispatching to outbound `{}`", handler.tag());
            let (inbound, outbound) = new_ray();
            tokio::spawn(async move {
                handler.dispatch(ctx, outbound).await;
            });
            Ok(inbound)
        }
        .instrument(span)
        .await
    }
}
