//! Transports the client can dial.
//!
//! A [`Connector`] yields a [`Link`]: a pair of message channels pumped by
//! background tasks, so the client never touches framing directly.

use std::fmt;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use relay_core::{BodyFormat, FrameCodec, JsonCodec, Message};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{ClientError, Result};

/// Capacity of each direction of a link.
const LINK_CAPACITY: usize = 256;

/// A live duplex link.
#[derive(Debug)]
pub struct Link {
    /// Messages to write.
    pub outbound: mpsc::Sender<Message>,
    /// Decoded messages read from the peer. Ends when the link drops.
    pub inbound: mpsc::Receiver<Message>,
    /// Cancelled when either side stops; cancel it to tear the link down.
    pub closed: CancellationToken,
}

/// Dials a server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link.
    async fn connect(&self) -> Result<Link>;

    /// Body encoding used on links from this connector.
    fn format(&self) -> BodyFormat;

    /// Target for logs.
    fn describe(&self) -> String;
}

/// Length-prefixed frames over TCP.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
    codec: FrameCodec,
}

impl TcpConnector {
    /// Connector for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>, codec: FrameCodec) -> Self {
        Self {
            addr: addr.into(),
            codec,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Link> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (sink, frames) = Framed::new(stream, self.codec.clone()).split();
        Ok(spawn_link(sink, frames))
    }

    fn format(&self) -> BodyFormat {
        BodyFormat::Binary(self.codec.order())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// JSON envelopes over WebSocket text frames.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
    codec: JsonCodec,
}

impl WsConnector {
    /// Connector for a `ws://` URL.
    pub fn new(url: impl Into<String>, codec: JsonCodec) -> Self {
        Self { url: url.into(), codec }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link> {
        let (socket, _) = connect_async(self.url.as_str()).await?;
        let (ws_tx, ws_rx) = socket.split();
        let codec = self.codec;

        let sink = ws_tx.with(move |message: Message| {
            future::ready(
                codec
                    .encode(&message)
                    .map(|text| WsMessage::Text(text.into()))
                    .map_err(ClientError::from),
            )
        });
        let frames = ws_rx.filter_map(move |frame| {
            future::ready(match frame {
                Ok(WsMessage::Text(text)) => Some(codec.decode(text.as_str()).map_err(ClientError::from)),
                Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => Some(codec.decode(text).map_err(ClientError::from)),
                    Err(_) => Some(Err(ClientError::Core(relay_core::CoreError::malformed(
                        "binary frame is not UTF-8",
                    )))),
                },
                Ok(WsMessage::Close(_)) => Some(Err(ClientError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(ClientError::from(err))),
            })
        });
        Ok(spawn_link(sink, frames))
    }

    fn format(&self) -> BodyFormat {
        BodyFormat::Json
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Pump `sink` and `stream` through a fresh [`Link`].
pub fn spawn_link<Si, St, E>(sink: Si, stream: St) -> Link
where
    Si: Sink<Message> + Send + 'static,
    Si::Error: fmt::Display + Send,
    St: Stream<Item = std::result::Result<Message, E>> + Send + 'static,
    E: fmt::Display + Send,
{
    let closed = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(LINK_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Message>(LINK_CAPACITY);

    let writer_closed = closed.clone();
    let _ = tokio::spawn(async move {
        let mut sink = std::pin::pin!(sink);
        loop {
            tokio::select! {
                () = writer_closed.cancelled() => break,
                next = out_rx.recv() => match next {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            warn!(error = %err, "write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sink.close().await;
        writer_closed.cancel();
    });

    let reader_closed = closed.clone();
    let _ = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                () = reader_closed.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "read ended");
                        break;
                    }
                    None => break,
                },
            }
        }
        reader_closed.cancel();
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
        closed,
    }
}
