//! Capture pipeline: turns a live stream of raw microphone batches into a
//! sequence of encoded outbound chunks.
//!
//! The pipeline consumes whatever batch sizes the input device produces,
//! cuts them into fixed-size frames, encodes each frame via the PCM codec
//! and hands the result to the sink with `try_send`. The sink contract is
//! best-effort ordered delivery with no backpressure into the pipeline: a
//! full sink drops the frame. Captured audio is consumed by the encoder
//! only and never routed back to the playback side.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::pcm;
use crate::types::AudioBlob;

pub struct CapturePipeline {
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Attaches the pipeline to a raw capture channel. Restarting an already
    /// running pipeline stops the previous run first.
    pub fn start(
        &mut self,
        mut frames_rx: mpsc::Receiver<Vec<f32>>,
        sink: mpsc::Sender<AudioBlob>,
        frame_size: usize,
    ) {
        self.stop();
        debug!("[Capture] Started, frame size {} samples", frame_size);

        self.task = Some(tokio::spawn(async move {
            let mut buffer: Vec<f32> = Vec::with_capacity(frame_size * 2);
            while let Some(batch) = frames_rx.recv().await {
                buffer.extend_from_slice(&batch);
                while buffer.len() >= frame_size {
                    let frame: Vec<f32> = buffer.drain(..frame_size).collect();
                    let chunk = pcm::encode_frame(&frame);
                    match sink.try_send(chunk) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("[Capture] Sink full, dropping one frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("[Capture] Sink closed, stopping");
                            return;
                        }
                    }
                }
            }
            debug!("[Capture] Input channel closed");
        }));
    }

    /// Detaches from the input stream. Idempotent: calling `stop` when not
    /// started is a no-op.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("[Capture] Stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
