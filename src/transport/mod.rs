//! Transport seam for the synchronization session.
//!
//! The engine only ever sees a request/response pair of traits: the
//! participant holds an [`RpcClient`], the host polls an [`RpcServer`] from
//! inside its tick. The in-memory [`pair`] backs tests and same-process
//! sessions; [`tcp`] carries real two-process runs.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{FrameError, Request, Response};

pub mod tcp;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Participant end: one in-flight call at a time, awaited at the engine's
/// only network suspension point.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response, TransportError>;
}

/// A request the host has not answered yet.
pub struct IncomingCall {
    pub request: Request,
    reply: oneshot::Sender<Response>,
}

impl IncomingCall {
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Response>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }

    pub fn respond(self, response: Response) {
        let _ = self.reply.send(response);
    }
}

/// Host end. `poll` never blocks; the engine drains it once per tick and
/// once per pause-barrier turn.
pub trait RpcServer: Send {
    fn poll(&mut self) -> Option<IncomingCall>;
}

type CallSlot = (Request, oneshot::Sender<Response>);

pub struct ChannelClient {
    tx: mpsc::UnboundedSender<CallSlot>,
}

#[async_trait]
impl RpcClient for ChannelClient {
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .map_err(|_| TransportError::ChannelClosed)?;
        reply_rx.await.map_err(|_| TransportError::ChannelClosed)
    }
}

pub struct ChannelServer {
    rx: mpsc::UnboundedReceiver<CallSlot>,
}

impl RpcServer for ChannelServer {
    fn poll(&mut self) -> Option<IncomingCall> {
        match self.rx.try_recv() {
            Ok((request, reply)) => Some(IncomingCall { request, reply }),
            Err(_) => None,
        }
    }
}

pub struct TransportPair {
    pub client: ChannelClient,
    pub server: ChannelServer,
}

/// Connected in-memory client/server endpoints.
pub fn pair() -> TransportPair {
    let (tx, rx) = mpsc::unbounded_channel();
    TransportPair {
        client: ChannelClient { tx },
        server: ChannelServer { rx },
    }
}
