use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{LinkError, WsFrame};

pub mod tungstenite;

pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), LinkError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// The connection actor owns state and policy; the transport only opens a
/// socket and hands back its read and write halves. Tests swap in
/// [`crate::testing::MockTransport`].
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, LinkError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static;

    fn connect(&self, url: String) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
