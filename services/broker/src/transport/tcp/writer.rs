// Outbound writer loop: the only code that writes to the socket.
//
// The session enqueues frames onto an mpsc channel drained here, so wire
// writes never interleave. When nothing has been written for the negotiated
// send interval, a single newline goes out as a heartbeat. When the channel
// closes, the queued frames are drained and the socket is shut down.
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::timeout;

use stampede_wire::Frame;
use stampede_wire::codec::FrameWriter;

pub(super) async fn run_writer(
    mut writer: FrameWriter<BufWriter<OwnedWriteHalf>>,
    mut wire_rx: mpsc::Receiver<Frame>,
    send_interval: Option<Duration>,
) {
    loop {
        let next = match send_interval {
            Some(interval) => match timeout(interval, wire_rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    // Idle past the negotiated send interval.
                    if writer.write_heartbeat().await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            None => wire_rx.recv().await,
        };
        match next {
            Some(frame) => {
                metrics::counter!("stampede_frames_out_total").increment(1);
                if let Err(err) = writer.write_frame(&frame).await {
                    tracing::debug!(error = %err, "socket write failed");
                    break;
                }
            }
            None => break,
        }
    }
    let _ = writer.shutdown().await;
}
