//! The agent's video socket: accept, demux, hand units to the broadcaster.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use droidmirror_protocol::{DemuxError, DemuxEvent, DemuxState, FrameDemuxer, Resolution, StreamMetadata};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;

/// Serve agent connections one at a time until cancelled.
///
/// A connection that closes after its metadata header just ends; the task
/// goes back to accepting. Losing the connection before the header arrives
/// means the agent never started streaming, which is returned as an error.
pub async fn run_demuxer(
    listener: TcpListener,
    stream_resolution: Arc<OnceLock<Resolution>>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) -> Result<(), DemuxError> {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Failed to accept agent connection: {e}");
                    continue;
                }
            },
        };
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer, "Failed to set TCP_NODELAY: {e}");
        }

        tracing::info!(%peer, "Agent video connection accepted");
        let units = serve_connection(socket, &stream_resolution, &broadcaster, &cancel).await?;
        tracing::info!(%peer, units, "Agent video connection closed");
    }
}

async fn serve_connection<R>(
    mut socket: R,
    stream_resolution: &OnceLock<Resolution>,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, DemuxError>
where
    R: AsyncRead + Unpin,
{
    let mut demuxer = FrameDemuxer::new();
    let mut units = 0u64;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(units),
            read = socket.read_buf(demuxer.buffer_mut()) => read,
        };
        match read {
            Ok(0) => {
                demuxer.finish()?;
                return Ok(units);
            }
            Ok(_) => {}
            Err(e) if demuxer.state() == DemuxState::AwaitingMetadata => {
                return Err(DemuxError::Io(e));
            }
            Err(e) => {
                tracing::warn!("Agent video connection read failed: {e}");
                return Ok(units);
            }
        }

        while let Some(event) = demuxer.next_event() {
            match event {
                DemuxEvent::Metadata(meta) => publish_resolution(stream_resolution, &meta),
                DemuxEvent::Unit(unit) => {
                    if !unit.is_empty() {
                        broadcaster.broadcast(&unit);
                        units += 1;
                    }
                }
                DemuxEvent::Corruption {
                    declared_length,
                    discarded,
                } => {
                    broadcaster
                        .metrics()
                        .corrupt_frames
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        declared_length,
                        discarded,
                        "Corrupt frame header, discarding buffered bytes"
                    );
                }
            }
        }
    }
}

fn publish_resolution(cell: &OnceLock<Resolution>, meta: &StreamMetadata) {
    let resolution = meta.resolution();
    match cell.get() {
        None => {
            // A racing second connection could win the set; both paths log.
            let current = *cell.get_or_init(|| resolution);
            if current == resolution {
                tracing::info!(
                    device_name = %meta.device_name,
                    codec = %meta.codec_name(),
                    %resolution,
                    "Stream metadata received"
                );
            } else {
                tracing::warn!(%current, ignored = %resolution, "Stream resolution already set");
            }
        }
        Some(current) if *current == resolution => {
            tracing::debug!(%resolution, "Agent reconnected with same resolution");
        }
        Some(current) => {
            tracing::warn!(
                %current,
                ignored = %resolution,
                "Agent reported a different resolution, keeping the first"
            );
        }
    }
}
