//! Length-prefixed JSON frames over TCP.
//!
//! One connection, one in-flight call: the participant writes a request
//! frame and reads the matching response before issuing the next call, which
//! mirrors the engine's single suspension point. I/O runs on helper tasks;
//! engine state is only touched when the engine polls its end.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{self, Request, Response};
use crate::transport::{IncomingCall, RpcClient, RpcServer, TransportError};

/// Default session port, kept from the original deployment.
pub const DEFAULT_PORT: u16 = 31415;

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub struct TcpRpcClient {
    tx: mpsc::UnboundedSender<(Request, oneshot::Sender<Response>)>,
    request_timeout: Duration,
}

impl TcpRpcClient {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        Self::connect_with_timeout(addr, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: &str,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<(Request, oneshot::Sender<Response>)>();

        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let bytes = match protocol::encode_request(&request) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(error = %err, "failed to encode request frame");
                        continue;
                    }
                };
                if write_frame(&mut writer, &bytes).await.is_err() {
                    break;
                }
                let frame = match read_frame(&mut reader).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                match protocol::decode_response(&frame) {
                    Ok(response) => {
                        let _ = reply.send(response);
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to decode response frame");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            tx,
            request_timeout,
        })
    }
}

#[async_trait]
impl RpcClient for TcpRpcClient {
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .map_err(|_| TransportError::ChannelClosed)?;
        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ChannelClosed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

pub struct TcpRpcServer {
    incoming: mpsc::UnboundedReceiver<IncomingCall>,
    local_addr: SocketAddr,
}

impl TcpRpcServer {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                };
                debug!(%peer, "participant connected");
                let _ = stream.set_nodelay(true);
                serve_connection(stream, tx.clone()).await;
                debug!(%peer, "participant connection closed");
            }
        });

        Ok(Self {
            incoming,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn serve_connection(stream: TcpStream, tx: mpsc::UnboundedSender<IncomingCall>) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let request = match protocol::decode_request(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to decode request frame");
                break;
            }
        };
        let (call, reply_rx) = IncomingCall::new(request);
        if tx.send(call).is_err() {
            break;
        }
        let Ok(response) = reply_rx.await else {
            break;
        };
        let Ok(bytes) = protocol::encode_response(&response) else {
            break;
        };
        if write_frame(&mut writer, &bytes).await.is_err() {
            break;
        }
    }
}

impl RpcServer for TcpRpcServer {
    fn poll(&mut self) -> Option<IncomingCall> {
        self.incoming.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_round_trip() {
        let mut server = TcpRpcServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let client = TcpRpcClient::connect(&addr).await.unwrap();

        let pump = tokio::spawn(async move {
            loop {
                if let Some(call) = server.poll() {
                    match call.request {
                        Request::GetTime => call.respond(Response::Time { elapsed_ms: 42 }),
                        _ => call.respond(Response::Ack { ok: true }),
                    }
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let response = client.call(Request::GetTime).await.unwrap();
        assert!(matches!(response, Response::Time { elapsed_ms: 42 }));
        pump.await.unwrap();
    }
}
