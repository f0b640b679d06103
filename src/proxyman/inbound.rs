use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::context::DispatchContext;
use crate::error::PolyrayError;
use crate::feature::{Dispatcher, Feature, InboundHandler, InboundHandlerManager};
use crate::net::{Destination, Network, TargetAddr};
use crate::proxy::Inbound;

/// Tagged registry of inbound handlers with a start/close cascade.
#[derive(Default)]
pub struct Manager {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    handlers: Vec<Arc<dyn InboundHandler>>,
    tagged: HashMap<String, Arc<dyn InboundHandler>>,
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

impl InboundHandlerManager for Manager {
    fn add_handler(&self, handler: Arc<dyn InboundHandler>) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        let tag = handler.tag().to_string();
        if !tag.is_empty() {
            if state.tagged.contains_key(&tag) {
                return Err(PolyrayError::DuplicateTag(tag));
            }
            state.tagged.insert(tag, handler.clone());
        }
        state.handlers.push(handler);
        Ok(())
    }

    fn get_handler(&self, tag: &str) -> crate::Result<Arc<dyn InboundHandler>> {
        self.state
            .lock()
            .unwrap()
            .tagged
            .get(tag)
            .cloned()
            .ok_or_else(|| PolyrayError::HandlerNotFound(tag.to_string()))
    }
}

/// Always-on listener worker: owns the socket, hands accepted connections
/// to its proxy on per-connection tasks.
pub struct Handler {
    tag: String,
    listen: SocketAddr,
    proxy: Arc<dyn Inbound>,
    dispatcher: Arc<dyn Dispatcher>,
    bound: Mutex<Option<SocketAddr>>,
    workers: Mutex<Option<(Vec<JoinHandle<()>>, CancellationToken)>>,
}

impl Handler {
    pub fn new(
        tag: impl Into<String>,
        listen: SocketAddr,
        proxy: Arc<dyn Inbound>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            tag: tag.into(),
            listen,
            proxy,
            dispatcher,
            bound: Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    /// The bound address; differs from the configured one when listening
    /// on an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.bound.lock().unwrap().unwrap_or(self.listen)
    }
}

async fn accept_loop(
    listener: TcpListener,
    proxy: Arc<dyn Inbound>,
    dispatcher: Arc<dyn Dispatcher>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("failed to accept: {}", e);
                        continue;
                    }
                };
                tracing::debug!("Accepted connection from `{}`", peer);

                let stream_span = tracing::info_span!("stream", peer = %peer);
                let proxy = proxy.clone();
                let dispatcher = dispatcher.clone();
                let ctx = DispatchContext {
                    source: Some(Destination::tcp(TargetAddr::SocketAddr(peer))),
                    ..DispatchContext::default()
                };
                tokio::spawn(async move {
                    if let Err(e) = proxy.process(ctx, Box::new(stream), dispatcher).await {
                        tracing::error!("Stream handling error: {}", e);
                    }
                }.instrument(stream_span));
            }
        }
    }
}

#[async_trait::async_trait]
impl InboundHandler for Handler {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn networks(&self) -> Vec<Network> {
        self.proxy.networks()
    }

    async fn start(&self) -> crate::Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        let local = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(local);
        tracing::info!("`{}` is listening on `{}`", self.tag, local);

        let cancel = CancellationToken::new();
        let span = tracing::info_span!("inbound", tag = %self.tag);
        let mut tasks = vec![tokio::spawn(
            accept_loop(
                listener,
                self.proxy.clone(),
                self.dispatcher.clone(),
                cancel.clone(),
            )
            .instrument(span),
        )];

        if self.proxy.networks().contains(&Network::Udp) {
            let socket = Arc::new(UdpSocket::bind(local).await?);
            let proxy = self.proxy.clone();
            let dispatcher = self.dispatcher.clone();
            let udp_cancel = cancel.clone();
            let span = tracing::info_span!("inbound_udp", tag = %self.tag);
            tasks.push(tokio::spawn(
                async move {
                    tokio::select! {
                        _ = udp_cancel.cancelled() => {}
                        result = proxy.process_packets(
                            DispatchContext::default(),
                            socket,
                            dispatcher,
                        ) => {
                            if let Err(e) = result {
                                tracing::warn!("UDP worker ended: {}", e);
                            }
                        }
                    }
                }
                .instrument(span),
            ));
        }

        *self.workers.lock().unwrap() = Some((tasks, cancel));
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        if let Some((tasks, cancel)) = self.workers.lock().unwrap().take() {
            cancel.cancel();
            for task in tasks {
                task.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedHandler(&'static str);

    #[async_trait::async_trait]
    impl InboundHandler for NamedHandler {
        fn tag(&self) -> &str {
            self.0
        }

        fn networks(&self) -> Vec<Network> {
            vec![Network::Tcp]
        }

        async fn start(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn close(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tags_are_unique() {
        let manager = Manager::new();
        manager.add_handler(Arc::new(NamedHandler("a"))).unwrap();
        manager.add_handler(Arc::new(NamedHandler(""))).unwrap();
        manager.add_handler(Arc::new(NamedHandler(""))).unwrap();

        assert!(manager.get_handler("a").is_ok());
        assert!(matches!(
            manager.get_handler("missing"),
            Err(PolyrayError::HandlerNotFound(_))
        ));
        assert!(matches!(
            manager.add_handler(Arc::new(NamedHandler("a"))),
            Err(PolyrayError::DuplicateTag(_))
        ));
    }
}
