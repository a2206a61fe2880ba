//! Raw framed links: the byte pipes underneath the secure channel.
//!
//! A link carries discrete frames in order. Over TCP each frame is prefixed
//! with its big-endian `u32` length; over WebSocket each frame is one binary
//! message.

use std::net::SocketAddr;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

use crate::error::NetworkError;

/// Largest frame accepted from a link.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// WebSocket stream type shared by the accepting and dialing sides.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established, not yet encrypted link to a peer.
pub enum RawLink {
    Tcp(TcpStream),
    WebSocket(Box<WsStream>),
}

impl RawLink {
    /// Dial a plain TCP link.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self::Tcp(stream))
    }

    /// Dial a WebSocket link.
    pub async fn connect_ws(addr: SocketAddr) -> Result<Self, NetworkError> {
        let url = format!("ws://{addr}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;
        Ok(Self::WebSocket(Box::new(ws_stream)))
    }

    /// Upgrade an accepted TCP socket to a WebSocket link.
    pub async fn accept_ws(stream: TcpStream) -> Result<Self, NetworkError> {
        let ws_stream = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| NetworkError::Transport(format!("WebSocket accept failed: {e}")))?;
        Ok(Self::WebSocket(Box::new(ws_stream)))
    }

    /// Send a single frame.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), NetworkError> {
        match self {
            Self::Tcp(stream) => write_tcp_frame(stream, frame).await,
            Self::WebSocket(ws) => ws
                .send(Message::Binary(frame.to_vec().into()))
                .await
                .map_err(|e| NetworkError::Transport(format!("Send error: {e}"))),
        }
    }

    /// Receive a single frame. `Ok(None)` means the remote closed the link.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        match self {
            Self::Tcp(stream) => read_tcp_frame(stream).await,
            Self::WebSocket(ws) => read_ws_frame(ws).await,
        }
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (LinkReader, LinkWriter) {
        match self {
            Self::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (LinkReader::Tcp(read), LinkWriter::Tcp(write))
            }
            Self::WebSocket(ws) => {
                let (sink, stream) = ws.split();
                (LinkReader::WebSocket(stream), LinkWriter::WebSocket(sink))
            }
        }
    }
}

/// Read half of a [`RawLink`].
pub enum LinkReader {
    Tcp(OwnedReadHalf),
    WebSocket(SplitStream<Box<WsStream>>),
}

impl LinkReader {
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        match self {
            Self::Tcp(read) => read_tcp_frame(read).await,
            Self::WebSocket(stream) => read_ws_frame(stream).await,
        }
    }
}

/// Write half of a [`RawLink`].
pub enum LinkWriter {
    Tcp(OwnedWriteHalf),
    WebSocket(SplitSink<Box<WsStream>, Message>),
}

impl LinkWriter {
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), NetworkError> {
        match self {
            Self::Tcp(write) => write_tcp_frame(write, frame).await,
            Self::WebSocket(sink) => sink
                .send(Message::Binary(frame.to_vec().into()))
                .await
                .map_err(|e| NetworkError::Transport(format!("Send error: {e}"))),
        }
    }

    /// Close the write side gracefully.
    pub async fn close(&mut self) {
        match self {
            Self::Tcp(write) => {
                let _ = write.shutdown().await;
            }
            Self::WebSocket(sink) => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }
    }
}

async fn write_tcp_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_LEN {
        return Err(NetworkError::Transport(format!(
            "Frame of {} bytes exceeds limit",
            frame.len()
        )));
    }
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_tcp_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::Transport(format!(
            "Incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    trace!("Read {len}-byte frame");
    Ok(Some(buf))
}

async fn read_ws_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>, NetworkError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if data.len() > MAX_FRAME_LEN {
                    return Err(NetworkError::Transport(format!(
                        "Incoming frame of {} bytes exceeds limit",
                        data.len()
                    )));
                }
                return Ok(Some(data.to_vec()));
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => {} // Ignore text/ping/pong
            Err(e) => return Err(NetworkError::Transport(format!("Read error: {e}"))),
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A connected pair of loopback TCP links.
#[cfg(test)]
pub(crate) async fn tcp_pair() -> (RawLink, RawLink) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(RawLink::connect_tcp(addr), listener.accept());
    (client.unwrap(), RawLink::Tcp(server.unwrap().0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_frames_preserve_boundaries() {
        let (mut a, mut b) = tcp_pair().await;
        a.send_frame(b"one").await.unwrap();
        a.send_frame(b"").await.unwrap();
        a.send_frame(&[9u8; 5000]).await.unwrap();

        assert_eq!(b.recv_frame().await.unwrap().unwrap(), b"one");
        assert_eq!(b.recv_frame().await.unwrap().unwrap(), b"");
        assert_eq!(b.recv_frame().await.unwrap().unwrap().len(), 5000);
    }

    #[tokio::test]
    async fn test_tcp_eof_is_none() {
        let (a, mut b) = tcp_pair().await;
        drop(a);
        assert!(b.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_websocket_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = RawLink::accept_ws(stream).await.unwrap();
            let frame = link.recv_frame().await.unwrap().unwrap();
            link.send_frame(&frame).await.unwrap();
        });

        let mut client = RawLink::connect_ws(addr).await.unwrap();
        client.send_frame(b"echo").await.unwrap();
        assert_eq!(client.recv_frame().await.unwrap().unwrap(), b"echo");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (a, b) = tcp_pair().await;
        let (_a_read, mut a_write) = a.split();
        let (mut b_read, _b_write) = b.split();

        a_write.send_frame(b"split").await.unwrap();
        assert_eq!(b_read.recv_frame().await.unwrap().unwrap(), b"split");

        a_write.close().await;
        assert!(b_read.recv_frame().await.unwrap().is_none());
    }
}
