use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tracing::debug;

use crate::core::{LinkError, LinkResult, WsFrame};

/// Owns the socket's write half and serializes writes to it.
///
/// One writer is spawned per open socket and stopped with it.
pub struct FrameWriter<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    closed: bool,
}

impl<W> FrameWriter<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }
}

impl<W> Actor for FrameWriter<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = LinkError;

    fn name() -> &'static str {
        "FrameWriter"
    }

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }
}

pub struct WriteFrame {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriteFrame> for FrameWriter<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: WriteFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.closed {
            return Err(LinkError::InvalidState("writer closed".to_string()));
        }
        debug!(
            target: "driver-link-writer",
            len = msg.frame.payload().map(<[u8]>::len),
            "writing frame"
        );
        self.writer.send(msg.frame).await
    }
}

/// Send a close frame and shut the write half. Later writes are rejected.
pub struct CloseSocket {
    pub code: u16,
    pub reason: String,
}

impl<W> KameoMessage<CloseSocket> for FrameWriter<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: CloseSocket,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.send(WsFrame::close(msg.code, msg.reason)).await?;
        self.writer.close().await
    }
}
