use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use crate::buffer::MultiBuffer;
use crate::context::DispatchContext;
use crate::feature::Dispatcher;
use crate::net::Destination;
use crate::ray::{InboundRay, PipeWriter};
use crate::signal::{cancel_after_inactivity, ActivityTimer};
use super::{ReplyCallback, UdpDispatcher};

/// Idle window before a NAT entry is torn down.
const SESSION_TIMEOUT: Duration = Duration::from_secs(120);

type SessionKey = (Option<Destination>, Destination);

struct SessionEntry {
    input: PipeWriter,
    timer: ActivityTimer,
}

/// Symmetric NAT table over dispatched rays: one entry per
/// `(source, destination)` pair. Replies flow through the callback
/// captured when the entry is created; the entry dies after sitting
/// idle or when the inner ray ends.
pub struct RayUdpDispatcher {
    dispatcher: Arc<dyn Dispatcher>,
    sessions: Arc<Mutex<HashMap<SessionKey, SessionEntry>>>,
}

impl RayUdpDispatcher {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait::async_trait]
impl UdpDispatcher for RayUdpDispatcher {
    async fn dispatch(
        &self,
        ctx: DispatchContext,
        dest: Destination,
        payload: BytesMut,
        on_reply: ReplyCallback,
    ) {
        let key = (ctx.source.clone(), dest.clone());

        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(&key) {
            entry.timer.update();
            let writer = entry.input.clone();
            drop(sessions);
            if let Err(e) = writer.write(MultiBuffer::from(payload)).await {
                tracing::debug!("failed to forward packet to `{}`: {}", dest, e);
            }
            return;
        }

        let cancel = CancellationToken::new();
        let mut session_ctx = ctx.child_with_target(dest.clone());
        session_ctx.cancel = cancel.clone();

        let ray = match self.dispatcher.dispatch(session_ctx, dest.clone()).await {
            Ok(ray) => ray,
            Err(e) => {
                tracing::warn!("failed to dispatch UDP packet to `{}`: {}", dest, e);
                return;
            }
        };
        let InboundRay { input, mut output } = ray;
        let timer = cancel_after_inactivity(cancel.clone(), SESSION_TIMEOUT);
        let writer = input.clone();

        sessions.insert(
            key.clone(),
            SessionEntry { input: input.clone(), timer: timer.clone() },
        );
        drop(sessions);

        let table = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = output.read() => match read {
                        Ok(Some(mut mb)) => {
                            timer.update();
                            while let Some(datagram) = mb.split_first() {
                                if !datagram.is_empty() {
                                    on_reply(datagram);
                                }
                            }
                        }
                        _ => break,
                    },
                }
            }
            input.close();
            table.lock().await.remove(&key);
        });

        if let Err(e) = writer.write(MultiBuffer::from(payload)).await {
            tracing::debug!("failed to forward packet to `{}`: {}", dest, e);
        }
    }
}
