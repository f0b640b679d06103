pub mod default;
pub mod udp;

pub use default::DefaultDispatcher;
pub use udp::RayUdpDispatcher;

use bytes::BytesMut;
use crate::context::DispatchContext;
use crate::net::Destination;

pub type ReplyCallback = Box<dyn Fn(BytesMut) + Send + Sync>;

/// Contract for per-packet UDP dispatch: replies re-enter through the
/// callback captured when the `(source, destination)` entry is created.
#[async_trait::async_trait]
pub trait UdpDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        ctx: DispatchContext,
        dest: Destination,
        payload: BytesMut,
        on_reply: ReplyCallback,
    );
}
