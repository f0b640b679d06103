use std::sync::Arc;
use crate::buffer::{BufferedReader, TransferType};
use crate::context::DispatchContext;
use crate::feature::Dispatcher;
use crate::mux::frame::{self, FrameMetadata, FrameOption, FrameWriter, SessionStatus};
use crate::mux::session::{Session, SessionManager};
use crate::net::{Destination, Network};
use crate::ray::{new_ray, InboundRay, OutboundRay, PipeReader, PipeWriter};

/// Server-side entry: sentinel-addressed dispatches become demultiplexing
/// workers, everything else passes straight through.
pub struct Server {
    dispatcher: Arc<dyn Dispatcher>,
}

impl Server {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn dispatch(
        &self,
        ctx: DispatchContext,
        dest: Destination,
    ) -> crate::Result<InboundRay> {
        if !frame::is_mux_destination(&dest) {
            return self.dispatcher.dispatch(ctx, dest).await;
        }

        let (inbound, outbound) = new_ray();
        let worker = ServerWorker {
            dispatcher: self.dispatcher.clone(),
            sessions: Arc::new(SessionManager::new()),
        };
        tokio::spawn(worker.run(ctx, outbound));
        Ok(inbound)
    }
}

struct ServerWorker {
    dispatcher: Arc<dyn Dispatcher>,
    sessions: Arc<SessionManager>,
}

impl ServerWorker {
    async fn run(self, ctx: DispatchContext, ray: OutboundRay) {
        let OutboundRay { input, output } = ray;
        let input_ctl = input.controller();
        let mut reader = BufferedReader::new(input);

        loop {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match reader.at_eof().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(_) => break,
            }

            if let Err(e) = self.handle_frame(&ctx, &mut reader, &output).await {
                tracing::warn!("failed to process mux frame: {}", e);
                input_ctl.close_error();
                break;
            }
        }

        self.sessions.close_all();
    }

    async fn handle_frame(
        &self,
        ctx: &DispatchContext,
        reader: &mut BufferedReader<PipeReader>,
        output: &PipeWriter,
    ) -> crate::Result<()> {
        let meta = FrameMetadata::read(reader).await?;

        match meta.status {
            SessionStatus::KeepAlive => {
                drain_if_data(reader, &meta).await?;
            }
            SessionStatus::New => {
                self.handle_status_new(ctx, &meta, reader, output).await?;
            }
            SessionStatus::Keep => {
                copy_to_session(reader, &self.sessions, &meta).await?;
            }
            SessionStatus::End => {
                self.sessions.remove(meta.session_id);
                drain_if_data(reader, &meta).await?;
            }
        }
        Ok(())
    }

    async fn handle_status_new(
        &self,
        ctx: &DispatchContext,
        meta: &FrameMetadata,
        reader: &mut BufferedReader<PipeReader>,
        output: &PipeWriter,
    ) -> crate::Result<()> {
        let Some(target) = meta.target.clone() else {
            drain_if_data(reader, meta).await?;
            return Ok(());
        };

        tracing::debug!("received mux request for `{}`", target);
        let inner = match self
            .dispatcher
            .dispatch(ctx.child_with_target(target.clone()), target.clone())
            .await
        {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!("failed to dispatch mux request to `{}`: {}", target, e);
                drain_if_data(reader, meta).await?;
                return Ok(());
            }
        };

        let transfer = match target.network {
            Network::Udp => TransferType::Packet,
            Network::Tcp => TransferType::Stream,
        };

        let InboundRay { input: inner_input, output: inner_output } = inner;
        let session = self
            .sessions
            .add(meta.session_id, transfer, inner_input);
        let writer = FrameWriter::new_response(meta.session_id, output.clone(), transfer);
        tokio::spawn(pump_response(
            session.clone(),
            inner_output,
            writer,
            self.sessions.clone(),
        ));

        copy_to_session(reader, &self.sessions, meta).await?;
        Ok(())
    }
}

async fn drain_if_data(
    reader: &mut BufferedReader<PipeReader>,
    meta: &FrameMetadata,
) -> std::io::Result<()> {
    if meta.option.has(FrameOption::DATA) {
        let len = reader.read_u16().await? as usize;
        reader.drain(len).await?;
    }
    Ok(())
}

async fn copy_to_session(
    reader: &mut BufferedReader<PipeReader>,
    sessions: &SessionManager,
    meta: &FrameMetadata,
) -> std::io::Result<()> {
    if !meta.option.has(FrameOption::DATA) {
        return Ok(());
    }
    let len = reader.read_u16().await? as usize;
    let data = reader.read_exact(len).await?;
    if let Some(session) = sessions.get(meta.session_id) {
        let _ = session
            .write_output(crate::buffer::MultiBuffer::from(data))
            .await;
    }
    Ok(())
}

/// Copies the inner ray's responses back as `Keep` frames, ending with an
/// `End` frame once the inner stream finishes.
async fn pump_response(
    session: Arc<Session>,
    mut inner_output: PipeReader,
    mut writer: FrameWriter,
    sessions: Arc<SessionManager>,
) {
    let done = session.done();
    let result = loop {
        tokio::select! {
            _ = done.wait() => break Ok(()),
            read = inner_output.read() => match read {
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
        tracing::debug!("mux session {} ends: {}", session.id, e);
    }
    let _ = writer.close().await;
    sessions.remove(session.id);
}
