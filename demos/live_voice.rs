// demos/live_voice.rs
//
// End-to-end voice session against a locally running proxy:
//
//   MENTOR_API_KEYS=... cargo run --bin mentor-proxy
//   cargo run --example live_voice
//
// Microphone audio is captured at 16kHz mono, streamed to the model, and the
// 24kHz replies are played back gaplessly. Ctrl+C tears the session down.

use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{error, info, warn};

use mentor_live::audio::{INPUT_SAMPLE_RATE_HZ, OUTPUT_SAMPLE_RATE_HZ, PlaybackChunk, PlaybackSink};
use mentor_live::{BackendClient, SessionConfig, SessionController, SessionState, TungsteniteConnector};

/// Sink that feeds scheduled chunks into the output device queue. The
/// scheduler hands chunks over in playback order, so a FIFO of samples is
/// enough for a demo; `halt` only matters on teardown, where dropping the
/// queue silences everything anyway.
struct DeviceSink {
    samples_tx: Sender<Vec<f32>>,
}

impl PlaybackSink for DeviceSink {
    fn begin(&mut self, _id: u64, chunk: &PlaybackChunk, _start_secs: f64) {
        if let Some(samples) = chunk.channel(0) {
            if self.samples_tx.send(samples.to_vec()).is_err() {
                warn!("[Demo] Output queue gone, dropping chunk");
            }
        }
    }

    fn halt(&mut self, _id: u64) {}
}

fn start_input(frames_tx: tokio::sync::mpsc::Sender<Vec<f32>>) -> Result<cpal::Stream, anyhow::Error> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("No input device"))?;
    info!("[Demo] Input device: {}", device.name()?);

    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(INPUT_SAMPLE_RATE_HZ),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if data.is_empty() {
                return;
            }
            // Best effort: a full channel just drops the batch.
            let _ = frames_tx.try_send(data.to_vec());
        },
        |err| error!("[Demo] Input stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

fn start_output(samples_rx: Receiver<Vec<f32>>) -> Result<cpal::Stream, anyhow::Error> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("No output device"))?;
    info!("[Demo] Output device: {}", device.name()?);

    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(OUTPUT_SAMPLE_RATE_HZ),
        buffer_size: cpal::BufferSize::Default,
    };
    let mut pending: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            while pending.len() < data.len() {
                match samples_rx.try_recv() {
                    Ok(samples) => pending.extend(samples),
                    Err(_) => break,
                }
            }
            let available = pending.len().min(data.len());
            data[..available].copy_from_slice(&pending[..available]);
            data[available..].fill(0.0);
            pending.drain(..available);
        },
        |err| error!("[Demo] Output stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    dotenv::dotenv().ok();

    let backend = BackendClient::local()?;
    let connector = TungsteniteConnector::default();
    let config = SessionConfig {
        system_instruction: "You are a friendly study mentor. Keep answers short and spoken-word natural.".to_string(),
        ..Default::default()
    };

    let (frames_tx, frames_rx) = tokio::sync::mpsc::channel::<Vec<f32>>(32);
    let (samples_tx, samples_rx) = bounded::<Vec<f32>>(100);

    let _input_stream = start_input(frames_tx)?;
    let _output_stream = start_output(samples_rx)?;

    let mut controller = SessionController::new(connector, backend, config);
    let mut status = controller.status();
    controller.start(frames_rx, Box::new(DeviceSink { samples_tx }))?;

    let status_task = {
        let mut status = status.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let s = status.borrow().clone();
                info!("[Demo] Session: {:?}, speaking: {}", s.state, s.speaking);
                if let Some(error) = &s.error {
                    error!("[Demo] {}", error);
                    if s.backend_hint {
                        error!("[Demo] Is the proxy running? Start it with: cargo run --bin mentor-proxy");
                    }
                }
            }
        })
    };

    info!("[Demo] Session starting. Speak into the microphone; Ctrl+C to exit.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[Demo] Ctrl+C, shutting down");
        }
        _ = async {
            loop {
                if status.changed().await.is_err() {
                    break;
                }
                let state = status.borrow().state;
                if matches!(state, SessionState::Closed | SessionState::Error) {
                    break;
                }
            }
        } => {}
    }

    controller.stop().await;
    status_task.abort();
    // Let the output queue drain before the streams drop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("[Demo] Done.");
    Ok(())
}
