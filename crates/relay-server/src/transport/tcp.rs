//! Length-prefixed binary frames over raw TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use metrics::counter;
use relay_core::{BodyFormat, CoreError, FrameCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Acceptor, drain_writer, log_io_error};
use crate::connection::Outbound;
use crate::metrics::FRAME_ERRORS_TOTAL;

/// Accept sockets until `cancel` fires.
pub async fn serve_tcp(listener: TcpListener, acceptor: Arc<Acceptor>, codec: FrameCodec, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "tcp listener started");
    }
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let _ = tokio::spawn(run_tcp_session(stream, peer, acceptor.clone(), codec.clone()));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
    info!("tcp listener stopped");
}

/// Drive one TCP client from accept to close.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn run_tcp_session(stream: TcpStream, peer: SocketAddr, acceptor: Arc<Acceptor>, codec: FrameCodec) {
    let format = BodyFormat::Binary(codec.order());
    let Ok((connection, mut outbound)) = acceptor.open(peer, format, "tcp") else {
        return;
    };
    let session_id = connection.session_id;
    let cancel = connection.cancel_token();

    let (mut sink, mut frames) = Framed::new(stream, codec).split();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let Outbound::Frame(message) = item else {
                break;
            };
            match sink.send(message).await {
                Ok(()) => {}
                Err(CoreError::Io(err)) => {
                    log_io_error(session_id, &err);
                    break;
                }
                Err(err) => warn!(session_id, error = %err, "outbound frame not encodable, dropped"),
            }
        }
        let _ = sink.close().await;
        writer_cancel.cancel();
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(message)) => {
                    let _ = acceptor.receive(&connection, message).await;
                }
                Some(Err(CoreError::Io(err))) => {
                    log_io_error(session_id, &err);
                    break;
                }
                Some(Err(err)) => {
                    counter!(FRAME_ERRORS_TOTAL, "transport" => "tcp").increment(1);
                    warn!(session_id, error = %err, "framing error, closing");
                    break;
                }
                None => {
                    debug!(session_id, "peer closed");
                    break;
                }
            },
        }
    }

    acceptor.close(&connection);
    let _ = drain_writer(session_id, writer).await;
}
