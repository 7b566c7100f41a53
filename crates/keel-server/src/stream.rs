//! Streaming client sessions.
//!
//! Clients outside the cluster speak WebSocket-style frames. Each binary
//! frame carries exactly one RPC frame encoded with the layouts this node
//! announces; each answer goes back as one unmasked binary frame. Client
//! frames must be masked. Only
//! [`Scope::Public`](keel_proto::Scope::Public) opcodes are served. A close
//! frame ends the session cleanly; any framing fault closes it.

use std::sync::Arc;

use keel_core::Environment;
use keel_proto::{
    Reader, RpcFrame, RpcTable, StreamFrame, StreamOpcode, StreamTable, Writer,
    stream::{write_binary_frame, write_close_frame},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::ServerError,
    node::{Node, Origin},
};

const READ_BUFFER: usize = 16 * 1024;

/// Serve one streaming client until it closes or misbehaves.
pub async fn run_stream<E, S>(node: Arc<Node<E>>, mut socket: S) -> Result<(), ServerError>
where
    E: Environment,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = Reader::new(StreamTable::from_clients());
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let frames = match reader.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(error = %err, "stream framing fault");
                close(&node, &mut socket).await?;
                return Err(err.into());
            },
        };

        for frame in frames {
            match frame.opcode {
                StreamOpcode::Close => {
                    close(&node, &mut socket).await?;
                    return Ok(());
                },
                StreamOpcode::Binary => {
                    let request = match embedded_request(&frame) {
                        Ok(request) => request,
                        Err(err) => {
                            close(&node, &mut socket).await?;
                            return Err(err);
                        },
                    };
                    if let Some(reply) = node.serve_request(&node.local_plans(), &request, Origin::Stream).await {
                        send(&node, &mut socket, &reply).await?;
                    }
                },
            }
        }
    }
}

fn embedded_request(frame: &StreamFrame) -> Result<RpcFrame, ServerError> {
    let mut reader = Reader::new(RpcTable::new());
    let mut frames = reader.feed(&frame.payload)?;
    if frames.len() != 1 || reader.buffered() > 0 {
        return Err(ServerError::MalformedStreamPayload { frames: frames.len(), trailing: reader.buffered() });
    }
    Ok(frames.remove(0))
}

async fn send<E: Environment, S: AsyncWrite + Unpin>(node: &Node<E>, socket: &mut S, reply: &Writer) -> Result<(), ServerError> {
    let mut out = node.writers().acquire();
    write_binary_frame(&mut out, &reply.to_bytes());
    write_all(socket, &out).await
}

async fn close<E: Environment, S: AsyncWrite + Unpin>(node: &Node<E>, socket: &mut S) -> Result<(), ServerError> {
    let mut out = node.writers().acquire();
    write_close_frame(&mut out);
    write_all(socket, &out).await?;
    socket.shutdown().await?;
    Ok(())
}

async fn write_all<S: AsyncWrite + Unpin>(socket: &mut S, out: &Writer) -> Result<(), ServerError> {
    for chunk in out.chunks() {
        socket.write_all(chunk).await?;
    }
    socket.flush().await?;
    Ok(())
}
