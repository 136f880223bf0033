use std::io::ErrorKind;

use msgpack_rpc_codec::FrameReader;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use super::reactor::completion_reactor::RpcCompletionReactor;
use crate::Error;

/// An encoded message waiting for the writer, and where to report how the write went.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    pub frame: Vec<u8>,
    pub written: oneshot::Sender<std::io::Result<()>>,
}

/// Writes queued frames one at a time, in queue order.
///
/// A failed write is reported to whoever queued the frame and does not stop the
/// writer. Shuts the stream down on the way out.
pub(crate) async fn write_outbound<Writer>(
    mut writer: Writer,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    shutdown: CancellationToken,
) where
    Writer: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(OutboundFrame { frame, written }) = next else {
            log::debug!("outbound queue closed");
            break;
        };
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                // An unanswered outcome reads as a closed connection.
                drop(written);
                break;
            }
            result = write_frame(&mut writer, &frame) => result,
        };
        match &result {
            Ok(()) => log::trace!("wrote {}b frame", frame.len()),
            Err(e) => log::warn!("error while writing {}b frame: {e:?}", frame.len()),
        }
        if let Err(_e) = written.send(result) {
            log::debug!("write outcome receiver dropped");
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("error shutting down the write stream: {e:?}");
    }
}

async fn write_frame<Writer>(writer: &mut Writer, frame: &[u8]) -> std::io::Result<()>
where
    Writer: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Reads the stream into the frame reader and routes every message it yields.
///
/// Returns why it stopped. Anything other than a shutdown request ends the
/// session.
pub(crate) async fn read_inbound<Reader>(
    mut reader: Reader,
    mut frames: FrameReader,
    mut reactor: RpcCompletionReactor,
    shutdown: CancellationToken,
) -> Error
where
    Reader: AsyncRead + Unpin,
{
    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Error::ConnectionClosed,
            read = reader.read_buf(frames.receive_buffer()) => read,
        };
        match read {
            Ok(0) => {
                log::info!(
                    "connection was shut down as read returned 0. {}b left undecoded",
                    frames.buffered_len()
                );
                return Error::ConnectionClosed;
            }
            Ok(bytes_read) => {
                log::trace!("read {bytes_read}b");
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                log::trace!("read interrupted - trying again");
                continue;
            }
            Err(e) => {
                log::warn!("error while reading from stream: {e:?}");
                return Error::TransportFailure(e);
            }
        }

        for message in frames.drain_messages() {
            let routed = message
                .map_err(Error::from)
                .and_then(|message| reactor.on_inbound_message(message));
            if let Err(e) = routed {
                return e;
            }
        }
    }
}
