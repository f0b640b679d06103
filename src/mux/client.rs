use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use crate::buffer::{BufferedReader, MultiBuffer, TransferType};
use crate::context::DispatchContext;
use crate::mux::frame::{self, FrameMetadata, FrameOption, FrameWriter, SessionStatus};
use crate::mux::session::{Session, SessionManager, MAX_TOTAL};
use crate::net::Network;
use crate::proxy::{Dialer, Outbound};
use crate::ray::{new_ray, OutboundRay, PipeController, PipeReader, PipeWriter};
use crate::signal::Done;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(16);

#[derive(Clone, Debug)]
pub struct MultiplexingConfig {
    pub enabled: bool,
    pub concurrency: u32,
}

impl Default for MultiplexingConfig {
    fn default() -> Self {
        Self { enabled: false, concurrency: 8 }
    }
}

/// Pool of multiplexed connections toward one outbound. Sessions land on
/// the first client with spare capacity, in insertion order; a new client
/// is opened only when every live one declines.
pub struct ClientManager {
    clients: Mutex<Vec<Arc<Client>>>,
    proxy: Arc<dyn Outbound>,
    dialer: Arc<dyn Dialer>,
    concurrency: u32,
}

impl ClientManager {
    pub fn new(
        proxy: Arc<dyn Outbound>,
        dialer: Arc<dyn Dialer>,
        config: &MultiplexingConfig,
    ) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            proxy,
            dialer,
            concurrency: config.concurrency,
        }
    }

    pub async fn dispatch(&self, ctx: DispatchContext, ray: OutboundRay) -> crate::Result<()> {
        let mut clients = self.clients.lock().await;
        clients.retain(|c| !c.closed());

        let mut ray = ray;
        for client in clients.iter() {
            match client.try_dispatch(ctx.clone(), ray) {
                Ok(()) => return Ok(()),
                Err(declined) => ray = declined,
            }
        }

        let client = Client::new(self.proxy.clone(), self.dialer.clone(), self.concurrency);
        if client.try_dispatch(ctx, ray).is_err() {
            return Err(crate::error::PolyrayError::Connection);
        }
        clients.push(client);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// One multiplexed connection: an uplink task running the underlying
/// proxy, a demultiplexer for response frames and an idle reaper.
pub struct Client {
    sessions: Arc<SessionManager>,
    input: PipeWriter,
    done: Done,
    concurrency: u32,
}

impl Client {
    pub fn new(proxy: Arc<dyn Outbound>, dialer: Arc<dyn Dialer>, concurrency: u32) -> Arc<Self> {
        let (inbound, outbound) = new_ray();
        let sessions = Arc::new(SessionManager::new());
        let done = Done::new();
        let ctx = DispatchContext::with_target(frame::mux_destination());

        let input = inbound.input.clone();
        let input_ctl = inbound.input.controller();
        let output_ctl = inbound.output.controller();

        {
            let done = done.clone();
            let cancel = ctx.cancel.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.process(ctx, outbound, dialer).await {
                    tracing::warn!("mux client connection ended: {}", e);
                }
                done.close();
                cancel.cancel();
            });
        }

        tokio::spawn(fetch_output(inbound.output, sessions.clone(), done.clone()));
        tokio::spawn(monitor(sessions.clone(), done.clone(), input_ctl, output_ctl));

        Arc::new(Self { sessions, input, done, concurrency })
    }

    pub fn closed(&self) -> bool {
        self.done.is_done()
    }

    /// Takes the session if capacity allows; hands the ray back otherwise
    /// so the caller can try the next client.
    pub fn try_dispatch(
        &self,
        ctx: DispatchContext,
        ray: OutboundRay,
    ) -> Result<(), OutboundRay> {
        if self.done.is_done()
            || self.sessions.size() >= self.concurrency as usize
            || self.sessions.count() >= MAX_TOTAL
        {
            return Err(ray);
        }

        let transfer = match ctx.target.as_ref().map(|d| d.network) {
            Some(Network::Udp) => TransferType::Packet,
            _ => TransferType::Stream,
        };

        let OutboundRay { input, output } = ray;
        let session = match self.sessions.allocate(transfer, output) {
            Ok(session) => session,
            Err(output) => return Err(OutboundRay { input, output }),
        };

        tokio::spawn(fetch_input(
            ctx,
            session,
            input,
            self.input.clone(),
            self.sessions.clone(),
        ));
        Ok(())
    }
}

/// Streams one session's request bytes into frames on the shared pipe.
async fn fetch_input(
    ctx: DispatchContext,
    session: Arc<Session>,
    mut input: PipeReader,
    frame_out: PipeWriter,
    sessions: Arc<SessionManager>,
) {
    let Some(dest) = ctx.target.clone() else {
        sessions.remove(session.id);
        return;
    };

    tracing::debug!("dispatching mux session {} to `{}`", session.id, dest);
    let mut writer = FrameWriter::new_client(session.id, dest, frame_out, session.transfer);
    let done = session.done();

    let result = loop {
        tokio::select! {
            _ = done.wait() => break Ok(()),
            read = input.read() => match read {
                Ok(Some(mb)) => {
                    if let Err(e) = writer.write(mb).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
        }
    };

    if let Err(e) = result {
        tracing::debug!("failed to fetch all input for session {}: {}", session.id, e);
    }
    let _ = writer.close().await;
    sessions.remove(session.id);
}

async fn drain_if_data<R: crate::buffer::Reader>(
    reader: &mut BufferedReader<R>,
    meta: &FrameMetadata,
) -> io::Result<()> {
    if meta.option.has(FrameOption::DATA) {
        let len = reader.read_u16().await? as usize;
        reader.drain(len).await?;
    }
    Ok(())
}

async fn copy_to_session<R: crate::buffer::Reader>(
    reader: &mut BufferedReader<R>,
    sessions: &SessionManager,
    meta: &FrameMetadata,
) -> io::Result<()> {
    if !meta.option.has(FrameOption::DATA) {
        return Ok(());
    }
    let len = reader.read_u16().await? as usize;
    let data = reader.read_exact(len).await?;
    if let Some(session) = sessions.get(meta.session_id) {
        // A session torn down mid-frame is not this stream's problem.
        let _ = session.write_output(MultiBuffer::from(data)).await;
    }
    Ok(())
}

/// Demultiplexes response frames back onto their sessions.
async fn fetch_output(output: PipeReader, sessions: Arc<SessionManager>, done: Done) {
    let mut reader = BufferedReader::new(output);

    loop {
        match reader.at_eof().await {
            Ok(true) => break,
            Ok(false) => {}
            Err(_) => break,
        }

        let meta = match FrameMetadata::read(&mut reader).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("failed to read metadata: {}", e);
                break;
            }
        };

        let result = match meta.status {
            // The client never initiates from the peer's side; drain.
            SessionStatus::New | SessionStatus::KeepAlive => {
                drain_if_data(&mut reader, &meta).await
            }
            SessionStatus::Keep => copy_to_session(&mut reader, &sessions, &meta).await,
            SessionStatus::End => {
                sessions.remove(meta.session_id);
                drain_if_data(&mut reader, &meta).await
            }
        };

        if let Err(e) = result {
            tracing::warn!("failed to process mux frame: {}", e);
            break;
        }
    }

    done.close();
}

/// Reaps the client once it has sat empty through a sweep; on done, tears
/// down sessions and both ray directions.
async fn monitor(
    sessions: Arc<SessionManager>,
    done: Done,
    input_ctl: PipeController,
    output_ctl: PipeController,
) {
    let mut timer = tokio::time::interval_at(
        tokio::time::Instant::now() + IDLE_SWEEP_INTERVAL,
        IDLE_SWEEP_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = done.wait() => {
                sessions.close_all();
                input_ctl.close();
                output_ctl.close_error();
                return;
            }
            _ = timer.tick() => {
                if sessions.size() == 0 && sessions.close_if_no_session() {
                    done.close();
                }
            }
        }
    }
}
