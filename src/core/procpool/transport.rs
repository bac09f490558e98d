// src/core/procpool/transport.rs

//! The framed IPC transport shared by the Hub and the worker runtime:
//! `len:u32-be || payload` on a Unix domain socket, with the one exception
//! that a worker's very first transmission on a fresh connection is its own
//! pid as a raw 4-byte big-endian integer, not a length-prefixed frame.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::core::CoreResult;
use crate::core::errors::CoreError;

/// Hard ceiling on a single frame's payload size: malformed or hostile
/// length prefixes are rejected before a buffer for them is ever allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Builds the `u32-be` length-delimited codec both sides of the transport
/// use once the connection is past its pid handshake.
pub fn framed_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// A framed duplex connection over a Unix stream.
pub type FramedConn = Framed<UnixStream, LengthDelimitedCodec>;

pub fn framed(stream: UnixStream) -> FramedConn {
    Framed::new(stream, framed_codec())
}

/// Reads the raw 4-byte big-endian pid a worker sends immediately after
/// connecting, before any length-delimited framing begins.
pub async fn read_pid_prefix(stream: &mut UnixStream) -> CoreResult<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Writes the raw 4-byte big-endian pid prefix a worker sends on connect.
pub async fn write_pid_prefix(stream: &mut UnixStream, pid: u32) -> CoreResult<()> {
    stream.write_all(&pid.to_be_bytes()).await?;
    Ok(())
}

/// Sends one frame and returns an error mapping any I/O failure onto
/// [`CoreError::Io`], keeping call sites free of manual `map_err`.
pub async fn send_frame(conn: &mut FramedConn, payload: Bytes) -> CoreResult<()> {
    use futures::SinkExt;
    conn.send(payload)
        .await
        .map_err(|e| CoreError::Io(std::sync::Arc::new(e)))
}

/// Reads exactly one frame. `Ok(None)` means the peer closed the connection
/// cleanly; that is the worker's clean-exit signal, or (on the parent side)
/// the "lost connection to the worker" condition.
pub async fn recv_frame(conn: &mut FramedConn) -> CoreResult<Option<BytesMut>> {
    use futures::StreamExt;
    match conn.next().await {
        Some(Ok(bytes)) => Ok(Some(bytes)),
        Some(Err(e)) => Err(CoreError::Io(std::sync::Arc::new(e))),
        None => Ok(None),
    }
}
